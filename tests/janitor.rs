use anyhow::Result;
use geomerge::config::CleanupConfig;
use geomerge::janitor::{CleanupOutcome, Janitor};
use geomerge::store::local::LocalStore;
use geomerge::testing::StubbornRemover;
use geomerge::workspace::WorkspaceHandle;
use std::fs;
use std::path::{Path, PathBuf};

const NO_WAIT: CleanupConfig = CleanupConfig {
    max_attempts: 3,
    backoff_ms: 0,
};

/// A small working area; returns the file that tests lock.
fn working_area(root: &Path) -> Result<PathBuf> {
    let chunk = root.join("chunks").join("chunk_R0");
    fs::create_dir_all(chunk.join("Rustico"))?;
    fs::write(chunk.join("container.json"), b"{}")?;
    fs::write(chunk.join("Rustico").join("Rustico_MASA.lock"), b"")?;
    let locked = chunk.join("Rustico").join("Rustico_MASA.jsonl");
    fs::write(&locked, b"{}\n")?;
    Ok(locked)
}

#[test]
fn removes_tree_on_first_attempt() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("temp_processing");
    working_area(&root)?;

    let mut ws = WorkspaceHandle::new();
    let mut scope = ws.enter(root.join("chunks/chunk_R0"));
    let outcome = Janitor::new(&NO_WAIT).clean(&root, &mut scope, &LocalStore::new());

    assert_eq!(outcome, CleanupOutcome::Removed { attempts: 1 });
    assert!(outcome.is_clean());
    assert!(!root.exists());
    assert_eq!(scope.current(), None);
    Ok(())
}

#[test]
fn retries_until_lock_is_released() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("temp_processing");
    let locked = working_area(&root)?;

    let janitor = Janitor::with_remover(&NO_WAIT, StubbornRemover::new().refuse(&locked, 2));
    let outcome = janitor.clean(&root, &mut WorkspaceHandle::new(), &LocalStore::new());

    assert_eq!(outcome, CleanupOutcome::Removed { attempts: 3 });
    assert_eq!(janitor.remover().refused(), 2);
    assert!(!root.exists());
    Ok(())
}

#[test]
fn permanent_lock_survives_without_error() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("temp_processing");
    let locked = working_area(&root)?;

    let janitor = Janitor::with_remover(&NO_WAIT, StubbornRemover::new().refuse_forever(&locked));
    let outcome = janitor.clean(&root, &mut WorkspaceHandle::new(), &LocalStore::new());

    assert_eq!(
        outcome,
        CleanupOutcome::Survived {
            attempts: 3,
            remaining: vec![locked.clone()],
        }
    );
    assert!(!outcome.is_clean());
    assert!(locked.exists());
    // everything that could go is gone, including the lock marker
    assert!(!root.join("chunks/chunk_R0/container.json").exists());
    assert!(!root.join("chunks/chunk_R0/Rustico/Rustico_MASA.lock").exists());
    Ok(())
}

#[test]
fn missing_root_is_already_clean() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let outcome = Janitor::new(&NO_WAIT).clean(
        &tmp.path().join("never_created"),
        &mut WorkspaceHandle::new(),
        &LocalStore::new(),
    );
    assert_eq!(outcome, CleanupOutcome::AlreadyClean);
    Ok(())
}
