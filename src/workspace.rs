//! Explicit workspace handle with scoped acquisition.
//!
//! Feature stores resolve bare record set names against a "current
//! workspace". Rather than keeping that pointer in global state, each worker
//! owns a [`WorkspaceHandle`] and switches it through [`WorkspaceHandle::enter`],
//! which returns a [`WorkspaceScope`] guard. The guard restores the previous
//! value when it is dropped, on every exit path including `?` returns and
//! panics, so nested scopes always unwind back to the outermost value.
//!
//! ```
//! use geomerge::workspace::WorkspaceHandle;
//! use std::path::Path;
//!
//! let mut ws = WorkspaceHandle::new();
//! {
//!     let mut outer = ws.enter("/data/a.gdb");
//!     {
//!         let inner = outer.enter("/data/b.gdb");
//!         assert_eq!(inner.current(), Some(Path::new("/data/b.gdb")));
//!     }
//!     assert_eq!(outer.current(), Some(Path::new("/data/a.gdb")));
//! }
//! assert_eq!(ws.current(), None);
//! ```

use crate::store::RecordSetPath;
use anyhow::{Result, anyhow};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

/// The container that bare record set names currently resolve against.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkspaceHandle {
    current: Option<PathBuf>,
}

impl WorkspaceHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current container, if any.
    #[must_use]
    pub fn current(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    /// Switch to `container` until the returned guard is dropped.
    pub fn enter(&mut self, container: impl Into<PathBuf>) -> WorkspaceScope<'_> {
        let prior = self.current.replace(container.into());
        WorkspaceScope {
            handle: self,
            prior,
        }
    }

    /// Run `f` with the workspace switched to `container`, restoring the
    /// prior value afterwards.
    pub fn scoped<T>(
        &mut self,
        container: impl Into<PathBuf>,
        f: impl FnOnce(&mut WorkspaceHandle) -> T,
    ) -> T {
        let mut scope = self.enter(container);
        f(&mut scope)
    }

    /// Release the handle. Outer scopes still restore their own prior value.
    pub fn clear(&mut self) {
        self.current = None;
    }

    /// Current container, or an error if the handle is released.
    ///
    /// # Errors
    ///
    /// Returns an error when no workspace is set.
    pub fn container(&self) -> Result<&Path> {
        self.current().ok_or_else(|| anyhow!("no workspace set"))
    }

    /// Resolve a record set name inside the current container.
    ///
    /// # Errors
    ///
    /// Returns an error when no workspace is set.
    pub fn resolve(&self, grouping: Option<&str>, name: &str) -> Result<RecordSetPath> {
        let container = self.container()?;
        Ok(RecordSetPath::new(container, grouping, name))
    }
}

/// Guard restoring the previous workspace on drop.
#[derive(Debug)]
pub struct WorkspaceScope<'a> {
    handle: &'a mut WorkspaceHandle,
    prior: Option<PathBuf>,
}

impl Deref for WorkspaceScope<'_> {
    type Target = WorkspaceHandle;

    fn deref(&self) -> &Self::Target {
        self.handle
    }
}

impl DerefMut for WorkspaceScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.handle
    }
}

impl Drop for WorkspaceScope<'_> {
    fn drop(&mut self) {
        self.handle.current = self.prior.take();
    }
}
