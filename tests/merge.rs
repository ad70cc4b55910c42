use anyhow::Result;
use geomerge::catalog::Category;
use geomerge::error::PipelineError;
use geomerge::merge::MergeReducer;
use geomerge::planner::{ChunkPlanner, WorkUnit};
use geomerge::pool::CancelToken;
use geomerge::store::local::LocalStore;
use geomerge::store::{FeatureStore, RecordSetPath};
use geomerge::testing::{FaultyStore, TestWorkspace};
use geomerge::worker::ChunkWorker;
use geomerge::workspace::WorkspaceHandle;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

const SR: u32 = 32628;

/// Build one intermediate container per unit and return their paths.
fn build_chunks(
    ws: &TestWorkspace,
    store: Arc<dyn FeatureStore>,
    chunks: usize,
) -> Result<(Vec<WorkUnit>, Vec<PathBuf>)> {
    let planner = ChunkPlanner::new(chunks, "shp", ws.root().join("chunks"));
    let plan = planner.plan(&[
        (Category::Rustico, ws.rustico_dir()),
        (Category::Urbano, ws.urbano_dir()),
    ])?;
    let worker = ChunkWorker::new(store, SR);
    let mut containers = Vec::new();
    for unit in &plan.units {
        let outcome = worker.process(unit, &CancelToken::new());
        assert!(outcome.is_success(), "{:?}", outcome.status);
        containers.push(unit.container.clone());
    }
    Ok((plan.units, containers))
}

#[test]
fn single_source_is_copied_verbatim() -> Result<()> {
    let ws = TestWorkspace::new()?;
    ws.add_points(Category::Rustico, "35001_MASA", 1, 6)?;
    let store = Arc::new(LocalStore::new());
    let (_, containers) = build_chunks(&ws, store.clone(), 1)?;

    let mut handle = WorkspaceHandle::new();
    let report = MergeReducer::new(store.clone(), SR).reduce(&mut handle, &containers, &ws.gdb())?;

    assert_eq!(report.copied, vec!["Rustico_MASA"]);
    assert!(report.merged.is_empty());
    assert!(report.failures.is_empty());
    assert_eq!(report.skipped.len(), 23);
    assert_eq!(report.rows, 6);
    assert_eq!(report.compact_error, None);
    assert_eq!(handle.current(), None);

    let source = RecordSetPath::new(&containers[0], Some("Rustico"), "Rustico_MASA");
    let target = RecordSetPath::new(ws.gdb(), Some("Rustico"), "Rustico_MASA");
    assert_eq!(store.read_record_set(&source)?, store.read_record_set(&target)?);
    assert_eq!(
        fs::read(LocalStore::record_set_file(&source))?,
        fs::read(LocalStore::record_set_file(&target))?
    );
    Ok(())
}

#[test]
fn multiple_sources_are_unioned() -> Result<()> {
    let ws = TestWorkspace::new()?;
    ws.add_points(Category::Urbano, "38001_PARCELA", 1, 9)?;
    ws.add_points(Category::Urbano, "38002_PARCELA", 100, 6)?;
    ws.add_points(Category::Urbano, "38003_PARCELA", 200, 3)?;
    let store = Arc::new(LocalStore::new());
    let (units, containers) = build_chunks(&ws, store.clone(), 3)?;
    assert_eq!(units.len(), 3);

    let mut handle = WorkspaceHandle::new();
    let report = MergeReducer::new(store.clone(), SR).reduce(&mut handle, &containers, &ws.gdb())?;

    assert_eq!(report.merged, vec!["Urbano_PARCELA"]);
    assert_eq!(report.written(), 1);
    let target = RecordSetPath::new(ws.gdb(), Some("Urbano"), "Urbano_PARCELA");
    assert_eq!(store.count_rows(&target)?, 18);
    assert_eq!(store.list_groupings(&ws.gdb())?, vec!["Rustico", "Urbano"]);
    Ok(())
}

#[test]
fn rerun_replaces_existing_targets() -> Result<()> {
    let ws = TestWorkspace::new()?;
    ws.add_points(Category::Urbano, "38001_CONSTRU", 1, 4)?;
    ws.add_points(Category::Urbano, "38002_CONSTRU", 10, 4)?;
    let store = Arc::new(LocalStore::new());
    let (_, containers) = build_chunks(&ws, store.clone(), 2)?;

    let reducer = MergeReducer::new(store.clone(), SR);
    let mut handle = WorkspaceHandle::new();
    reducer.reduce(&mut handle, &containers, &ws.gdb())?;
    let report = reducer.reduce(&mut handle, &containers, &ws.gdb())?;

    assert!(report.failures.is_empty());
    let target = RecordSetPath::new(ws.gdb(), Some("Urbano"), "Urbano_CONSTRU");
    assert_eq!(store.count_rows(&target)?, 8);
    Ok(())
}

#[test]
fn target_without_sources_is_removed_on_rerun() -> Result<()> {
    let ws = TestWorkspace::new()?;
    ws.add_points(Category::Rustico, "35001_PARCELA", 1, 3)?;
    let masa = ws.add_points(Category::Rustico, "35009_MASA", 10, 2)?;
    let store = Arc::new(LocalStore::new());
    let reducer = MergeReducer::new(store.clone(), SR);
    let mut handle = WorkspaceHandle::new();

    let (_, containers) = build_chunks(&ws, store.clone(), 1)?;
    reducer.reduce(&mut handle, &containers, &ws.gdb())?;
    let stale = RecordSetPath::new(ws.gdb(), Some("Rustico"), "Rustico_MASA");
    assert!(store.record_set_exists(&stale));

    // Second run over inputs that no longer carry any MASA layer.
    if let Some(dir) = masa.parent() {
        fs::remove_dir_all(dir)?;
    }
    fs::remove_dir_all(ws.root().join("chunks"))?;
    let (_, containers) = build_chunks(&ws, store.clone(), 1)?;
    let report = reducer.reduce(&mut handle, &containers, &ws.gdb())?;

    assert!(report.failures.is_empty());
    assert_eq!(report.removed, vec!["Rustico_MASA"]);
    assert!(report.skipped.iter().any(|t| t == "Rustico_MASA"));
    assert!(!store.record_set_exists(&stale));
    let parcela = RecordSetPath::new(ws.gdb(), Some("Rustico"), "Rustico_PARCELA");
    assert_eq!(store.count_rows(&parcela)?, 3);
    Ok(())
}

#[test]
fn failed_target_does_not_stop_the_rest() -> Result<()> {
    let ws = TestWorkspace::new()?;
    ws.add_points(Category::Rustico, "35001_PARCELA", 1, 2)?;
    ws.add_points(Category::Rustico, "35001_SUBPARCE", 10, 2)?;
    ws.add_points(Category::Urbano, "38001_PARCELA", 20, 2)?;
    let store = Arc::new(FaultyStore::new(LocalStore::new()).fail_merge_of("Rustico_PARCELA"));
    let (_, containers) = build_chunks(&ws, store.clone(), 1)?;

    let mut handle = WorkspaceHandle::new();
    let report = MergeReducer::new(store.clone(), SR).reduce(&mut handle, &containers, &ws.gdb())?;

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].target, "Rustico_PARCELA");
    assert_eq!(report.copied, vec!["Rustico_SUBPARCE", "Urbano_PARCELA"]);
    let subparce = RecordSetPath::new(ws.gdb(), Some("Rustico"), "Rustico_SUBPARCE");
    assert_eq!(store.count_rows(&subparce)?, 2);
    Ok(())
}

#[test]
fn unusable_final_container_is_fatal() -> Result<()> {
    let ws = TestWorkspace::new()?;
    ws.add_points(Category::Urbano, "38001_MASA", 1, 1)?;
    let store = Arc::new(FaultyStore::new(LocalStore::new()).fail_container_matching("final.gdb"));
    let (_, containers) = build_chunks(&ws, store.clone(), 1)?;

    let mut handle = WorkspaceHandle::new();
    let err = MergeReducer::new(store, SR)
        .reduce(&mut handle, &containers, &ws.gdb())
        .unwrap_err();
    assert!(matches!(err, PipelineError::FinalContainer { .. }), "{err}");
    Ok(())
}
