//! End-to-end orchestration.
//!
//! ```text
//! ingest (optional) → plan → worker pool → merge + compact → tables (optional) → cleanup
//! ```
//!
//! Only [`PipelineError`] conditions abort a run. The elapsed wall-clock time
//! is logged when [`Pipeline::run`] or [`run_from_file`] returns, whatever the
//! outcome. The working area is torn down only after a successful merge, so a
//! failed run leaves its intermediate containers behind for inspection; the
//! next run clears them before dispatching any unit.

use crate::config::{Parallelism, PipelineConfig};
use crate::enrich::{Enricher, ReferenceTable, ReferenceTableEnricher};
use crate::error::{PipelineError, Result};
use crate::ingest::FileOrganizer;
use crate::janitor::{CleanupOutcome, Janitor};
use crate::merge::{MergeReducer, MergeReport};
use crate::planner::{ChunkPlanner, PlanningWarning};
use crate::pool::{CancelToken, PoolReport, WorkerPool};
use crate::store::FeatureStore;
use crate::tables::{TableConsolidator, TableReport};
use crate::worker::ChunkWorker;
use crate::workspace::WorkspaceHandle;
use anyhow::{Context, anyhow};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Logs the time since creation when dropped.
#[derive(Debug)]
pub struct ElapsedReport {
    label: &'static str,
    start: Instant,
}

impl ElapsedReport {
    #[must_use]
    pub fn start(label: &'static str) -> Self {
        Self {
            label,
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for ElapsedReport {
    fn drop(&mut self) {
        let minutes = self.start.elapsed().as_secs_f64() / 60.0;
        info!(stage = self.label, minutes = format_args!("{minutes:.2}"), "total elapsed time");
    }
}

/// What the ingest stage did.
#[derive(Clone, Debug, Default)]
pub struct IngestSummary {
    pub archives_extracted: usize,
    pub archive_failures: usize,
    pub folders_moved: usize,
}

/// Everything a successful run reports.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub parallelism: Parallelism,
    pub ingest: Option<IngestSummary>,
    pub warnings: Vec<PlanningWarning>,
    pub files: usize,
    pub pool: PoolReport,
    pub merge: MergeReport,
    /// Present when `consolidate_tables` is set.
    pub tables: Option<TableReport>,
    pub cleanup: CleanupOutcome,
    pub elapsed: Duration,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn FeatureStore>,
    enricher: Option<Arc<dyn Enricher>>,
    cancel: CancelToken,
    skip_ingest: bool,
}

impl Pipeline {
    /// A pipeline over `store`. The cancel token carries the configured
    /// timeout, if any.
    pub fn new(config: PipelineConfig, store: Arc<dyn FeatureStore>) -> Self {
        let cancel = config
            .timeout()
            .map_or_else(CancelToken::new, CancelToken::with_timeout);
        Self {
            config,
            store,
            enricher: None,
            cancel,
            skip_ingest: false,
        }
    }

    /// Use `enricher` in the work units instead of the configured reference
    /// table. Table consolidation keeps using the configured table.
    #[must_use]
    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Start from already organized category directories.
    #[must_use]
    pub fn skip_ingest(mut self, skip: bool) -> Self {
        self.skip_ingest = skip;
        self
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn load_reference(&self) -> Result<Option<ReferenceTableEnricher>> {
        let Some(path) = &self.config.reference_table else {
            info!("no reference table configured; enrichment disabled");
            return Ok(None);
        };
        let table = ReferenceTable::from_file(path)
            .map_err(|e| PipelineError::Config(format!("{e:#}")))?;
        info!(table = %path.display(), entries = table.len(), "loaded reference table");
        Ok(Some(ReferenceTableEnricher::new(table)))
    }

    /// Remove intermediate containers left by an earlier run so no unit
    /// reuses their record sets.
    fn clear_stale_chunks(&self, chunk_dir: &Path) -> Result<()> {
        info!(dir = %chunk_dir.display(), "removing intermediate containers from an earlier run");
        let outcome = Janitor::new(&self.config.cleanup).clean(
            chunk_dir,
            &mut WorkspaceHandle::new(),
            self.store.as_ref(),
        );
        if outcome.is_clean() {
            Ok(())
        } else {
            Err(anyhow!(
                "intermediate containers from an earlier run could not be removed from {}",
                chunk_dir.display()
            )
            .into())
        }
    }

    fn ingest(&self) -> Result<IngestSummary> {
        let mut summary = IngestSummary::default();
        #[cfg(feature = "zip-extract")]
        {
            let report = crate::ingest::ArchiveExtractor::new()
                .extract_all(&self.config.input, &self.config.output)?;
            summary.archives_extracted = report.extracted.len();
            summary.archive_failures = report.failures.len() + report.unsupported.len();
        }
        #[cfg(not(feature = "zip-extract"))]
        warn!("built without zip-extract; skipping archive extraction");

        let report = FileOrganizer::new().organize(&self.config.output)?;
        summary.folders_moved = report.moved.len();
        Ok(summary)
    }

    /// Run every stage.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] when no useful output can be produced:
    /// the reference table is unreadable, intermediate containers of an
    /// earlier run cannot be removed, every work unit failed, the final
    /// container is unusable, or the run was cancelled.
    pub fn run(&self) -> Result<RunSummary> {
        let report = ElapsedReport::start("pipeline");
        self.execute(&report)
    }

    fn execute(&self, report: &ElapsedReport) -> Result<RunSummary> {
        let config = &self.config;
        let reference = self.load_reference()?;
        let enricher = self.enricher.clone().or_else(|| {
            reference
                .clone()
                .map(|r| Arc::new(r) as Arc<dyn Enricher>)
        });

        let ingest = if self.skip_ingest {
            None
        } else {
            info!(input = %config.input.display(), output = %config.output.display(), "ingesting archives");
            Some(self.ingest()?)
        };

        let parallelism = config.parallelism.resolve();
        info!(
            workers = parallelism.workers,
            chunks_per_category = parallelism.chunks_per_category,
            "resolved parallelism"
        );
        let chunk_dir = config.chunk_dir();
        let planner = ChunkPlanner::new(
            parallelism.chunks_per_category,
            config.source_extension.as_str(),
            chunk_dir.as_path(),
        );
        let plan = planner.plan(&config.category_dirs())?;
        for warning in &plan.warnings {
            warn!(%warning, "planning warning");
        }
        if plan.units.is_empty() {
            return Err(PipelineError::NoSuccessfulUnits { total: 0 });
        }
        if chunk_dir.exists() {
            self.clear_stale_chunks(&chunk_dir)?;
        }
        fs::create_dir_all(&chunk_dir)
            .with_context(|| format!("create {}", chunk_dir.display()))?;

        let mut worker = ChunkWorker::new(Arc::clone(&self.store), config.spatial_reference);
        if let Some(e) = enricher {
            worker = worker.with_enricher(e);
        }
        let pool = WorkerPool::new(parallelism.workers).run(&worker, &plan.units, &self.cancel)?;

        let sources: Vec<PathBuf> = pool.succeeded().map(|o| o.container.clone()).collect();
        let mut ws = WorkspaceHandle::new();
        let merge = MergeReducer::new(Arc::clone(&self.store), config.spatial_reference)
            .reduce(&mut ws, &sources, &config.gdb)?;

        let tables = config.consolidate_tables.then(|| {
            let mut consolidator = TableConsolidator::new(Arc::clone(&self.store));
            if let Some(r) = reference {
                consolidator = consolidator.with_reference(r);
            }
            consolidator.consolidate(&mut ws, &config.category_dirs(), &config.gdb)
        });

        let cleanup = Janitor::new(&config.cleanup).clean(
            &config.temp_root(),
            &mut ws,
            self.store.as_ref(),
        );

        Ok(RunSummary {
            parallelism,
            ingest,
            warnings: plan.warnings.clone(),
            files: plan.file_count(),
            pool,
            merge,
            tables,
            cleanup,
            elapsed: report.elapsed(),
        })
    }
}

/// Load the configuration at `path`, turn it into a [`Pipeline`] with
/// `setup`, and run it. The elapsed-time report also covers loading the
/// configuration, so it is emitted even when the file is unusable.
///
/// # Errors
///
/// Returns [`PipelineError::Config`] if the file cannot be loaded, otherwise
/// whatever [`Pipeline::run`] returns.
pub fn run_from_file(
    path: &Path,
    store: Arc<dyn FeatureStore>,
    setup: impl FnOnce(PipelineConfig, Arc<dyn FeatureStore>) -> Pipeline,
) -> Result<RunSummary> {
    let report = ElapsedReport::start("run");
    let config = PipelineConfig::from_file(path)
        .map_err(|e| PipelineError::Config(format!("{e:#}")))?;
    setup(config, store).execute(&report)
}
