//! Retrying teardown of the transient working area.
//!
//! Store processes may keep files open for a while after a run, so removal is
//! attempted up to `max_attempts` times. Each attempt:
//!
//! 1. releases the workspace handle and the store's cached handles
//! 2. deletes any `*.lock` markers below the root (best effort)
//! 3. waits `backoff`
//! 4. removes the tree depth-first, skipping entries that refuse to go
//!
//! A tree that survives every attempt is reported as
//! [`CleanupOutcome::Survived`], never as an error.

use crate::config::CleanupConfig;
use crate::store::FeatureStore;
use crate::workspace::WorkspaceHandle;
use glob::{Pattern, glob};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Filesystem deletions used by the [`Janitor`].
pub trait Remover: Send + Sync {
    /// # Errors
    ///
    /// Returns the underlying I/O error if the file cannot be removed.
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Remove an empty directory.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the directory cannot be removed.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;
}

/// [`Remover`] backed by `std::fs`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsRemover;

impl Remover for FsRemover {
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Nothing existed at the root.
    AlreadyClean,
    Removed { attempts: u32 },
    /// Entries still present after the last attempt.
    Survived {
        attempts: u32,
        remaining: Vec<PathBuf>,
    },
}

impl CleanupOutcome {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !matches!(self, CleanupOutcome::Survived { .. })
    }
}

pub struct Janitor<R: Remover = FsRemover> {
    max_attempts: u32,
    backoff: Duration,
    remover: R,
}

impl Janitor<FsRemover> {
    #[must_use]
    pub fn new(config: &CleanupConfig) -> Self {
        Self::with_remover(config, FsRemover)
    }
}

impl<R: Remover> Janitor<R> {
    pub fn with_remover(config: &CleanupConfig, remover: R) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff(),
            remover,
        }
    }

    #[must_use]
    pub fn remover(&self) -> &R {
        &self.remover
    }

    /// Remove `root` and everything below it.
    pub fn clean(
        &self,
        root: &Path,
        ws: &mut WorkspaceHandle,
        store: &dyn FeatureStore,
    ) -> CleanupOutcome {
        if !root.exists() {
            return CleanupOutcome::AlreadyClean;
        }

        for attempt in 1..=self.max_attempts {
            ws.clear();
            store.clear_workspace_cache();
            self.remove_lock_markers(root);
            thread::sleep(self.backoff);
            self.sweep(root);

            if !root.exists() {
                info!(root = %root.display(), attempt, "temporary files removed");
                return CleanupOutcome::Removed { attempts: attempt };
            }
            debug!(root = %root.display(), attempt, "cleanup attempt left entries behind");
        }

        let remaining = remaining_entries(root);
        warn!(
            root = %root.display(),
            attempts = self.max_attempts,
            remaining = remaining.len(),
            "could not fully remove temporary files"
        );
        for path in &remaining {
            warn!(path = %path.display(), "locked entry");
        }
        CleanupOutcome::Survived {
            attempts: self.max_attempts,
            remaining,
        }
    }

    fn remove_lock_markers(&self, root: &Path) {
        let Some(base) = root.to_str() else {
            return;
        };
        let pattern = format!("{}/**/*.lock", Pattern::escape(base));
        let Ok(entries) = glob(&pattern) else {
            return;
        };
        for path in entries.flatten() {
            if let Err(e) = self.remover.remove_file(&path) {
                debug!(path = %path.display(), error = %e, "lock marker not removed");
            }
        }
    }

    /// Depth-first removal. Returns whether `path` is gone.
    fn sweep(&self, path: &Path) -> bool {
        let Ok(meta) = fs::symlink_metadata(path) else {
            return !path.exists();
        };
        if !meta.is_dir() {
            return match self.remover.remove_file(path) {
                Ok(()) => true,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "entry not removed");
                    false
                }
            };
        }

        let mut all_gone = true;
        if let Ok(entries) = fs::read_dir(path) {
            for entry in entries.flatten() {
                all_gone &= self.sweep(&entry.path());
            }
        }
        if !all_gone {
            return false;
        }
        match self.remover.remove_dir(path) {
            Ok(()) => true,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "directory not removed");
                false
            }
        }
    }
}

/// Files left below `root`; the root itself if only directories remain.
fn remaining_entries(root: &Path) -> Vec<PathBuf> {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, out);
            } else {
                out.push(path);
            }
        }
    }

    let mut out = Vec::new();
    walk(root, &mut out);
    if out.is_empty() && root.exists() {
        out.push(root.to_path_buf());
    }
    out.sort();
    out
}
