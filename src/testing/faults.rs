//! Fault injection for stores and filesystem removal.

use crate::janitor::Remover;
use crate::store::{
    FeatureStore, FieldDef, GeometryKind, RecordSetPath, RowVisitor, SchemaPolicy,
};
use anyhow::{Result, bail};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Wraps a [`FeatureStore`] and fails selected operations.
///
/// ```
/// use geomerge::store::local::LocalStore;
/// use geomerge::store::FeatureStore;
/// use geomerge::testing::FaultyStore;
/// use std::path::Path;
///
/// let store = FaultyStore::new(LocalStore::new()).fail_container_matching("chunk_R3");
/// assert!(store.create_container(Path::new("/tmp/x/chunk_R3")).is_err());
/// ```
pub struct FaultyStore<S> {
    inner: S,
    containers: Vec<String>,
    imports: Vec<String>,
    merges: Vec<String>,
    panics: Vec<String>,
}

fn hit(patterns: &[String], subject: &str) -> bool {
    patterns.iter().any(|p| subject.contains(p.as_str()))
}

impl<S: FeatureStore> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            containers: Vec::new(),
            imports: Vec::new(),
            merges: Vec::new(),
            panics: Vec::new(),
        }
    }

    /// Fail `create_container` for paths containing `pattern`.
    #[must_use]
    pub fn fail_container_matching(mut self, pattern: &str) -> Self {
        self.containers.push(pattern.to_string());
        self
    }

    /// Fail `import_file` and `import_table` for source paths containing `pattern`.
    #[must_use]
    pub fn fail_import_matching(mut self, pattern: &str) -> Self {
        self.imports.push(pattern.to_string());
        self
    }

    /// Fail `merge` and `copy_record_set` into targets named `name`.
    #[must_use]
    pub fn fail_merge_of(mut self, name: &str) -> Self {
        self.merges.push(name.to_string());
        self
    }

    /// Panic inside `create_container` for paths containing `pattern`.
    #[must_use]
    pub fn panic_on_container_matching(mut self, pattern: &str) -> Self {
        self.panics.push(pattern.to_string());
        self
    }

    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check_merge(&self, target: &RecordSetPath) -> Result<()> {
        if self.merges.iter().any(|n| *n == target.name) {
            bail!("injected merge failure for {target}");
        }
        Ok(())
    }
}

impl<S: FeatureStore> FeatureStore for FaultyStore<S> {
    fn create_container(&self, path: &Path) -> Result<()> {
        let subject = path.to_string_lossy();
        assert!(
            !hit(&self.panics, &subject),
            "injected panic creating {subject}"
        );
        if hit(&self.containers, &subject) {
            bail!("injected failure creating container {subject}");
        }
        self.inner.create_container(path)
    }

    fn container_exists(&self, path: &Path) -> bool {
        self.inner.container_exists(path)
    }

    fn create_grouping(
        &self,
        container: &Path,
        name: &str,
        spatial_reference: u32,
    ) -> Result<()> {
        self.inner.create_grouping(container, name, spatial_reference)
    }

    fn grouping_exists(&self, container: &Path, name: &str) -> bool {
        self.inner.grouping_exists(container, name)
    }

    fn list_groupings(&self, container: &Path) -> Result<Vec<String>> {
        self.inner.list_groupings(container)
    }

    fn import_file(&self, source: &Path, target: &RecordSetPath) -> Result<u64> {
        if hit(&self.imports, &source.to_string_lossy()) {
            bail!("injected import failure for {}", source.display());
        }
        self.inner.import_file(source, target)
    }

    fn import_table(&self, source: &Path, target: &RecordSetPath) -> Result<u64> {
        if hit(&self.imports, &source.to_string_lossy()) {
            bail!("injected import failure for {}", source.display());
        }
        self.inner.import_table(source, target)
    }

    fn record_set_exists(&self, path: &RecordSetPath) -> bool {
        self.inner.record_set_exists(path)
    }

    fn list_record_sets(&self, container: &Path, grouping: Option<&str>) -> Result<Vec<String>> {
        self.inner.list_record_sets(container, grouping)
    }

    fn describe_geometry(&self, path: &RecordSetPath) -> Result<GeometryKind> {
        self.inner.describe_geometry(path)
    }

    fn list_fields(&self, path: &RecordSetPath) -> Result<Vec<FieldDef>> {
        self.inner.list_fields(path)
    }

    fn count_rows(&self, path: &RecordSetPath) -> Result<u64> {
        self.inner.count_rows(path)
    }

    fn add_field(&self, path: &RecordSetPath, field: &FieldDef) -> Result<()> {
        self.inner.add_field(path, field)
    }

    fn delete_field(&self, path: &RecordSetPath, name: &str) -> Result<()> {
        self.inner.delete_field(path, name)
    }

    fn create_record_set(
        &self,
        path: &RecordSetPath,
        template: &RecordSetPath,
        spatial_reference: u32,
    ) -> Result<()> {
        self.inner.create_record_set(path, template, spatial_reference)
    }

    fn delete_record_set(&self, path: &RecordSetPath) -> Result<()> {
        self.inner.delete_record_set(path)
    }

    fn update_rows(
        &self,
        path: &RecordSetPath,
        fields: &[&str],
        visit: &mut RowVisitor<'_>,
    ) -> Result<u64> {
        self.inner.update_rows(path, fields, visit)
    }

    fn append(
        &self,
        sources: &[RecordSetPath],
        target: &RecordSetPath,
        policy: SchemaPolicy,
    ) -> Result<u64> {
        self.inner.append(sources, target, policy)
    }

    fn merge(&self, sources: &[RecordSetPath], target: &RecordSetPath) -> Result<u64> {
        self.check_merge(target)?;
        self.inner.merge(sources, target)
    }

    fn copy_record_set(&self, source: &RecordSetPath, target: &RecordSetPath) -> Result<u64> {
        self.check_merge(target)?;
        self.inner.copy_record_set(source, target)
    }

    fn compact(&self, container: &Path) -> Result<()> {
        self.inner.compact(container)
    }

    fn clear_workspace_cache(&self) {
        self.inner.clear_workspace_cache();
    }
}

/// [`Remover`] that refuses to delete chosen files, simulating external locks.
#[derive(Debug, Default)]
pub struct StubbornRemover {
    /// Remaining refusals per file; `None` refuses forever.
    locks: Mutex<HashMap<PathBuf, Option<u32>>>,
    refused: Mutex<u32>,
}

impl StubbornRemover {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the first `times` removals of `path`.
    #[must_use]
    pub fn refuse(self, path: impl Into<PathBuf>, times: u32) -> Self {
        self.lock_table().insert(path.into(), Some(times));
        self
    }

    /// Refuse every removal of `path`.
    #[must_use]
    pub fn refuse_forever(self, path: impl Into<PathBuf>) -> Self {
        self.lock_table().insert(path.into(), None);
        self
    }

    /// Total removals refused so far.
    #[must_use]
    pub fn refused(&self) -> u32 {
        *self.refused.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Option<u32>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn should_refuse(&self, path: &Path) -> bool {
        let mut table = self.lock_table();
        let refuse = match table.get_mut(path) {
            Some(None) => true,
            Some(Some(n)) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        };
        if refuse {
            *self.refused.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        }
        refuse
    }
}

impl Remover for StubbornRemover {
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        if self.should_refuse(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is locked", path.display()),
            ));
        }
        fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }
}
