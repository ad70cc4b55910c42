use anyhow::Result;
use geomerge::catalog::Category;
use geomerge::enrich::{
    MUNICIPALITY_NAME_FIELD, MunicipalityInfo, ReferenceTable, ReferenceTableEnricher,
};
use geomerge::pipeline::Pipeline;
use geomerge::store::local::LocalStore;
use geomerge::store::{FeatureStore, GeometryKind, Record, RecordSetPath, Schema, Value};
use geomerge::tables::{
    MUNICIPAL_CODE_FIELD, TableConsolidator, TableKind, municipal_code, table_category,
};
use geomerge::testing::{ShapefileWriter, TestWorkspace};
use geomerge::workspace::WorkspaceHandle;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn street_table(path: &Path, streets: &[&str]) -> Result<()> {
    let mut writer = ShapefileWriter::new(GeometryKind::Null).text_field("NOMBRE", 40);
    for street in streets {
        writer = writer.row(vec![Value::from(*street)]);
    }
    writer.write_dbf(path)
}

fn crop_table(path: &Path, crops: &[i64]) -> Result<()> {
    let mut writer = ShapefileWriter::new(GeometryKind::Null).long_field("CULTIVO");
    for crop in crops {
        writer = writer.row(vec![Value::Int(*crop)]);
    }
    writer.write_dbf(path)
}

/// Two urban street tables, one rural street table, one crop table and a
/// shapefile attribute table that is not a standalone table.
fn table_layout(ws: &TestWorkspace) -> Result<()> {
    let urbano = ws.urbano_dir();
    let rustico = ws.rustico_dir();
    street_table(&urbano.join("38001UA/38001UA_Carvia.dbf"), &["Calle Mayor", "Calle Real"])?;
    street_table(&urbano.join("38002UA/38002UA_Carvia.dbf"), &["Avenida Maritima"])?;
    street_table(&rustico.join("35001RA/35001RA_Carvia.dbf"), &["Camino Viejo"])?;
    crop_table(&rustico.join("35001RA/35001RA_RUCULTIVO.dbf"), &[3, 7])?;
    crop_table(&rustico.join("35001RA/35001RA_MASA.dbf"), &[1])?;
    Ok(())
}

fn input_dirs(ws: &TestWorkspace) -> Vec<(Category, std::path::PathBuf)> {
    vec![
        (Category::Rustico, ws.rustico_dir()),
        (Category::Urbano, ws.urbano_dir()),
    ]
}

fn final_container(ws: &TestWorkspace, store: &LocalStore) -> Result<()> {
    store.create_container(&ws.gdb())
}

fn read_table(ws: &TestWorkspace, name: &str) -> Result<(Schema, Vec<Record>)> {
    LocalStore::new().read_record_set(&RecordSetPath::new(ws.gdb(), None, name))
}

fn codes(schema: &Schema, records: &[Record]) -> BTreeSet<i64> {
    let col = schema.field_index(MUNICIPAL_CODE_FIELD).unwrap_or(usize::MAX);
    records
        .iter()
        .filter_map(|r| r.attributes.get(col).and_then(Value::as_i64))
        .collect()
}

#[test]
fn file_names_identify_tables() {
    assert_eq!(TableKind::from_file_name("38001UA_Carvia.dbf"), Some(TableKind::Carvia));
    assert_eq!(TableKind::from_file_name("35001RA_carvia.DBF"), Some(TableKind::Carvia));
    assert_eq!(
        TableKind::from_file_name("35001RA_RUSUBPARCELA.dbf"),
        Some(TableKind::Subparcela)
    );
    assert_eq!(TableKind::from_file_name("35001RA_Carvia.shp"), None);
    assert_eq!(TableKind::from_file_name("35001_MASA.dbf"), None);

    assert_eq!(municipal_code("38001UA_Carvia.dbf"), Some(38001));
    assert_eq!(municipal_code("UA_Carvia.dbf"), None);

    assert_eq!(table_category("38001UA_Carvia.dbf"), Some(Category::Urbano));
    assert_eq!(table_category("35001ra_Carvia.dbf"), Some(Category::Rustico));
    assert_eq!(table_category("38001_Carvia.dbf"), None);
}

#[test]
fn tables_are_merged_per_type() -> Result<()> {
    let ws = TestWorkspace::new()?;
    table_layout(&ws)?;
    let store = Arc::new(LocalStore::new());
    final_container(&ws, &store)?;
    let reference = ReferenceTableEnricher::new(ReferenceTable::from_entries([MunicipalityInfo {
        code: 38001,
        municipality: "Adeje".to_string(),
        island: "Tenerife".to_string(),
        istac_code: 38001,
        ine_island_code: 380,
    }]));

    let mut handle = WorkspaceHandle::new();
    let report = TableConsolidator::new(store.clone())
        .with_reference(reference)
        .consolidate(&mut handle, &input_dirs(&ws), &ws.gdb());

    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.imported.len(), 4);
    assert_eq!(
        report.merged,
        vec!["Urbano_Carvia", "Rustico_Carvia", "Rustico_RUCULTIVO"]
    );
    assert_eq!(report.rows, 6);
    assert_eq!(handle.current(), None);
    // per-municipality tables are gone
    assert_eq!(
        store.list_record_sets(&ws.gdb(), None)?,
        vec!["Rustico_Carvia", "Rustico_RUCULTIVO", "Urbano_Carvia"]
    );

    let (schema, records) = read_table(&ws, "Urbano_Carvia")?;
    assert_eq!(schema.geometry, GeometryKind::Null);
    assert_eq!(records.len(), 3);
    assert_eq!(codes(&schema, &records), BTreeSet::from([38001, 38002]));
    let code = schema.field_index(MUNICIPAL_CODE_FIELD).unwrap_or(usize::MAX);
    let name = schema.field_index(MUNICIPALITY_NAME_FIELD).unwrap_or(usize::MAX);
    for record in &records {
        let expected = match record.attributes[code].as_i64() {
            Some(38001) => Value::from("Adeje"),
            _ => Value::Null,
        };
        assert_eq!(record.attributes[name], expected);
    }

    let (schema, records) = read_table(&ws, "Rustico_RUCULTIVO")?;
    assert_eq!(codes(&schema, &records), BTreeSet::from([35001]));
    assert_eq!(records.len(), 2);
    Ok(())
}

#[test]
fn rerun_reflects_current_tables() -> Result<()> {
    let ws = TestWorkspace::new()?;
    table_layout(&ws)?;
    let store = Arc::new(LocalStore::new());
    final_container(&ws, &store)?;
    let consolidator = TableConsolidator::new(store.clone());
    let mut handle = WorkspaceHandle::new();
    consolidator.consolidate(&mut handle, &input_dirs(&ws), &ws.gdb());

    fs::remove_file(ws.urbano_dir().join("38002UA/38002UA_Carvia.dbf"))?;
    fs::remove_file(ws.rustico_dir().join("35001RA/35001RA_RUCULTIVO.dbf"))?;
    let report = consolidator.consolidate(&mut handle, &input_dirs(&ws), &ws.gdb());

    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.merged, vec!["Urbano_Carvia", "Rustico_Carvia"]);
    assert_eq!(report.removed, vec!["Rustico_RUCULTIVO"]);
    let (schema, records) = read_table(&ws, "Urbano_Carvia")?;
    assert_eq!(records.len(), 2);
    assert_eq!(codes(&schema, &records), BTreeSet::from([38001]));
    assert!(!store.record_set_exists(&RecordSetPath::new(ws.gdb(), None, "Rustico_RUCULTIVO")));
    Ok(())
}

#[test]
fn leftover_municipal_tables_are_not_merged() -> Result<()> {
    let ws = TestWorkspace::new()?;
    table_layout(&ws)?;
    let store = Arc::new(LocalStore::new());
    final_container(&ws, &store)?;
    // what an interrupted run leaves at the container root
    let stale_source = ws.root().join("stale.dbf");
    street_table(&stale_source, &["Calle Vieja"])?;
    let stale = RecordSetPath::new(ws.gdb(), None, "Urbano_Carvia_38999");
    store.import_table(&stale_source, &stale)?;

    let report = TableConsolidator::new(store.clone()).consolidate(
        &mut WorkspaceHandle::new(),
        &input_dirs(&ws),
        &ws.gdb(),
    );

    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert!(!store.record_set_exists(&stale));
    let (_, records) = read_table(&ws, "Urbano_Carvia")?;
    assert_eq!(records.len(), 3);
    Ok(())
}

#[test]
fn broken_table_is_reported_and_the_rest_merge() -> Result<()> {
    let ws = TestWorkspace::new()?;
    table_layout(&ws)?;
    let broken = ws.urbano_dir().join("38003UA/38003UA_Carvia.dbf");
    if let Some(parent) = broken.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&broken, b"not a table")?;
    let store = Arc::new(LocalStore::new());
    final_container(&ws, &store)?;

    let report = TableConsolidator::new(store.clone()).consolidate(
        &mut WorkspaceHandle::new(),
        &input_dirs(&ws),
        &ws.gdb(),
    );

    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].subject.contains("38003UA_Carvia"), "{:?}", report.failures);
    assert!(report.merged.iter().any(|t| t == "Urbano_Carvia"));
    let (_, records) = read_table(&ws, "Urbano_Carvia")?;
    assert_eq!(records.len(), 3);
    Ok(())
}

#[test]
fn pipeline_consolidates_tables_only_when_enabled() -> Result<()> {
    for enabled in [false, true] {
        let ws = TestWorkspace::new()?;
        ws.add_points(Category::Urbano, "38001_PARCELA", 1, 4)?;
        street_table(&ws.urbano_dir().join("38001/38001UA_Carvia.dbf"), &["Calle Mayor"])?;
        let mut config = ws.config(1, 1);
        config.consolidate_tables = enabled;

        let summary = Pipeline::new(config, Arc::new(LocalStore::new()))
            .skip_ingest(true)
            .run()?;

        assert_eq!(summary.files, 1);
        let merged = summary.tables.map(|t| t.merged);
        if enabled {
            assert_eq!(merged, Some(vec!["Urbano_Carvia".to_string()]));
        } else {
            assert_eq!(merged, None);
        }
        let table = RecordSetPath::new(ws.gdb(), None, "Urbano_Carvia");
        assert_eq!(LocalStore::new().record_set_exists(&table), enabled);
    }
    Ok(())
}
