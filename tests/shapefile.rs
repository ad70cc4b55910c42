use anyhow::Result;
use geomerge::store::shapefile::{geometry_kind, read_dbf, read_shapefile};
use geomerge::store::{FieldDef, FieldType, Geometry, GeometryKind, Value};
use geomerge::testing::ShapefileWriter;
use std::fs;

#[test]
fn reads_points_with_mixed_attributes() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("35001_ELEMTEX.shp");
    ShapefileWriter::new(GeometryKind::Point)
        .long_field("ID")
        .text_field("TEXTO", 12)
        .field(FieldDef::double("ROT"))
        .point(1.5, -2.25, vec![Value::Int(1), "Agaete".into(), Value::Float(45.5)])
        .point(3.0, 4.0, vec![Value::Int(2), "".into(), Value::Null])
        .write(&path)?;

    let data = read_shapefile(&path)?;
    assert_eq!(data.schema.geometry, GeometryKind::Point);
    assert_eq!(
        data.schema.fields,
        vec![
            FieldDef::long("ID"),
            FieldDef::text("TEXTO", 12),
            FieldDef::new("ROT", FieldType::Double, None),
        ]
    );
    assert_eq!(data.records.len(), 2);
    assert_eq!(data.records[0].geometry, Geometry::Point { x: 1.5, y: -2.25 });
    assert_eq!(
        data.records[0].attributes,
        vec![Value::Int(1), Value::Text("Agaete".into()), Value::Float(45.5)]
    );
    assert_eq!(
        data.records[1].attributes,
        vec![Value::Int(2), Value::Text(String::new()), Value::Null]
    );
    Ok(())
}

#[test]
fn deleted_rows_are_skipped() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("35001_MASA.shp");
    ShapefileWriter::new(GeometryKind::Point)
        .long_field("ID")
        .point(0.0, 0.0, vec![Value::Int(1)])
        .deleted_record(Geometry::Point { x: 9.0, y: 9.0 }, vec![Value::Int(2)])
        .point(1.0, 1.0, vec![Value::Int(3)])
        .write(&path)?;

    let ids: Vec<Option<i64>> = read_shapefile(&path)?
        .records
        .iter()
        .map(|r| r.attributes[0].as_i64())
        .collect();
    assert_eq!(ids, vec![Some(1), Some(3)]);
    Ok(())
}

#[test]
fn reads_polygons_with_holes() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("35001_PARCELA.shp");
    let rings = vec![
        vec![[0.0, 0.0], [0.0, 10.0], [10.0, 10.0], [10.0, 0.0], [0.0, 0.0]],
        vec![[2.0, 2.0], [4.0, 2.0], [4.0, 4.0], [2.0, 2.0]],
    ];
    ShapefileWriter::new(GeometryKind::Polygon)
        .long_field("ID")
        .record(Geometry::Polygon { rings: rings.clone() }, vec![Value::Int(1)])
        .write(&path)?;

    let data = read_shapefile(&path)?;
    assert_eq!(data.schema.geometry, GeometryKind::Polygon);
    assert_eq!(data.records[0].geometry, Geometry::Polygon { rings });
    Ok(())
}

#[test]
fn missing_dbf_yields_geometry_only_rows() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("35001_EJES.shp");
    ShapefileWriter::new(GeometryKind::Multipoint)
        .record(
            Geometry::Multipoint {
                points: vec![[1.0, 2.0], [3.0, 4.0]],
            },
            vec![],
        )
        .write(&path)?;
    fs::remove_file(path.with_extension("dbf"))?;

    let data = read_shapefile(&path)?;
    assert!(data.schema.fields.is_empty());
    assert_eq!(data.records.len(), 1);
    assert!(data.records[0].attributes.is_empty());
    Ok(())
}

#[test]
fn reads_standalone_tables() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("38001UA_Carvia.dbf");
    ShapefileWriter::new(GeometryKind::Null)
        .long_field("VIA")
        .text_field("NOMBRE", 30)
        .row(vec![Value::Int(12), Value::from("Calle Mayor")])
        .deleted_record(Geometry::Null, vec![Value::Int(13), Value::from("Calle Vieja")])
        .row(vec![Value::Int(14), Value::Null])
        .write_dbf(&path)?;
    assert!(!path.with_extension("shp").exists());

    let data = read_dbf(&path)?;
    assert_eq!(data.schema.geometry, GeometryKind::Null);
    assert_eq!(data.schema.spatial_reference, None);
    assert_eq!(
        data.schema.fields,
        vec![FieldDef::long("VIA"), FieldDef::text("NOMBRE", 30)]
    );
    let rows: Vec<&[Value]> = data.records.iter().map(|r| r.attributes.as_slice()).collect();
    assert_eq!(
        rows,
        vec![
            &[Value::Int(12), Value::from("Calle Mayor")][..],
            &[Value::Int(14), Value::Text(String::new())][..],
        ]
    );
    assert!(data.records.iter().all(|r| r.geometry == Geometry::Null));
    Ok(())
}

#[test]
fn rejects_garbage() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("broken.shp");
    fs::write(&path, b"not a shapefile")?;
    assert!(read_shapefile(&path).is_err());
    assert!(read_shapefile(&tmp.path().join("absent.shp")).is_err());
    assert_eq!(geometry_kind(13)?, GeometryKind::Polyline);
    assert!(geometry_kind(31).is_err());
    Ok(())
}
