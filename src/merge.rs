//! Merge reducer: combines intermediate containers into the final container.
//!
//! Targets are visited in the fixed [`all_targets`] order, never derived from
//! chunk contents, so the final inventory depends only on which record sets
//! exist, not on how files were packed into units. For each target:
//!
//! | sources | action |
//! | --- | --- |
//! | 0 | skipped; a stale copy from an earlier run is deleted |
//! | 1 | copied verbatim |
//! | 2+ | union merge |
//!
//! A target already present in the final container is replaced. Failures are
//! recorded per target and never stop the remaining targets.

use crate::catalog::{all_targets, target_name};
use crate::error::{PipelineError, Result};
use crate::store::{FeatureStore, RecordSetPath};
use crate::worker::ensure_groupings;
use crate::workspace::WorkspaceHandle;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A target whose copy or merge failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeFailure {
    pub target: String,
    pub error: String,
}

#[derive(Clone, Debug, Default)]
pub struct MergeReport {
    pub copied: Vec<String>,
    pub merged: Vec<String>,
    /// Targets with no source in any intermediate container.
    pub skipped: Vec<String>,
    /// Skipped targets that an earlier run had left in the final container.
    pub removed: Vec<String>,
    pub failures: Vec<MergeFailure>,
    pub rows: u64,
    /// Set when the final compaction pass failed; the merged data is intact.
    pub compact_error: Option<String>,
}

impl MergeReport {
    /// Targets written to the final container.
    #[must_use]
    pub fn written(&self) -> usize {
        self.copied.len() + self.merged.len()
    }
}

pub struct MergeReducer {
    store: Arc<dyn FeatureStore>,
    spatial_reference: u32,
}

impl MergeReducer {
    pub fn new(store: Arc<dyn FeatureStore>, spatial_reference: u32) -> Self {
        Self {
            store,
            spatial_reference,
        }
    }

    /// Create the final container if needed, verify it, and establish its
    /// groupings.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::FinalContainer`] if any of that fails.
    pub fn prepare(&self, container: &Path) -> Result<()> {
        let unusable = |reason: String| PipelineError::FinalContainer {
            path: container.to_path_buf(),
            reason,
        };
        if !self.store.container_exists(container) {
            self.store
                .create_container(container)
                .map_err(|e| unusable(format!("{e:#}")))?;
            info!(container = %container.display(), "created final container");
        }
        if !self.store.container_exists(container) {
            return Err(unusable("missing after creation".to_string()));
        }
        ensure_groupings(self.store.as_ref(), container, self.spatial_reference)
            .map_err(|e| unusable(format!("{e:#}")))
    }

    /// Reduce the `sources` containers into `container`, then compact it.
    /// `ws` points at the final container while targets are written and is
    /// restored afterwards.
    ///
    /// # Errors
    ///
    /// Only fails if the final container cannot be prepared.
    pub fn reduce(
        &self,
        ws: &mut WorkspaceHandle,
        sources: &[PathBuf],
        container: &Path,
    ) -> Result<MergeReport> {
        self.prepare(container)?;
        let store = self.store.as_ref();
        let mut report = MergeReport::default();

        let scope = ws.enter(container);
        for (category, record_type) in all_targets() {
            let grouping = Some(category.grouping_name());
            let name = target_name(category, record_type);
            let inputs: Vec<RecordSetPath> = sources
                .iter()
                .map(|c| RecordSetPath::new(c, grouping, &name))
                .filter(|rs| store.record_set_exists(rs))
                .collect();
            if inputs.is_empty() {
                let removed = scope
                    .resolve(grouping, &name)
                    .and_then(|target| self.remove_stale(&target));
                match removed {
                    Ok(true) => {
                        info!(record_set = %name, "no sources; removed target from an earlier run");
                        report.removed.push(name.clone());
                    }
                    Ok(false) => debug!(record_set = %name, "no sources; skipping"),
                    Err(e) => {
                        warn!(record_set = %name, error = %format!("{e:#}"), "stale target removal failed");
                        report.failures.push(MergeFailure {
                            target: name.clone(),
                            error: format!("{e:#}"),
                        });
                    }
                }
                report.skipped.push(name);
                continue;
            }

            let result = scope
                .resolve(grouping, &name)
                .and_then(|target| self.reduce_one(&inputs, &target));
            match result {
                Ok(rows) => {
                    info!(record_set = %name, sources = inputs.len(), rows, "merged");
                    report.rows += rows;
                    if inputs.len() == 1 {
                        report.copied.push(name);
                    } else {
                        report.merged.push(name);
                    }
                }
                Err(e) => {
                    warn!(record_set = %name, error = %format!("{e:#}"), "merge failed");
                    report.failures.push(MergeFailure {
                        target: name,
                        error: format!("{e:#}"),
                    });
                }
            }
        }
        drop(scope);

        if let Err(e) = store.compact(container) {
            warn!(container = %container.display(), error = %format!("{e:#}"), "compaction failed");
            report.compact_error = Some(format!("{e:#}"));
        }
        info!(
            written = report.written(),
            skipped = report.skipped.len(),
            removed = report.removed.len(),
            failed = report.failures.len(),
            rows = report.rows,
            "merge complete"
        );
        Ok(report)
    }

    fn remove_stale(&self, target: &RecordSetPath) -> anyhow::Result<bool> {
        if !self.store.record_set_exists(target) {
            return Ok(false);
        }
        self.store.delete_record_set(target)?;
        Ok(true)
    }

    fn reduce_one(&self, inputs: &[RecordSetPath], target: &RecordSetPath) -> anyhow::Result<u64> {
        if self.store.record_set_exists(target) {
            self.store.delete_record_set(target)?;
        }
        match inputs {
            [single] => self.store.copy_record_set(single, target),
            _ => self.store.merge(inputs, target),
        }
    }
}
