//! Chunk worker: builds one intermediate container from a [`WorkUnit`].
//!
//! A worker runs these steps against its own container, reached through a
//! [`WorkspaceHandle`] it owns for the duration of the unit:
//!
//! 1. Create the container if needed and establish one grouping per category
//! 2. Import every source file as a root record set (existing ones are skipped)
//! 3. Stamp the partition key onto every row of every root record set
//! 4. Create missing `{category}_{recordType}` targets from a matching template
//! 5. Append same-geometry root record sets into each empty target
//! 6. Run the enrichment collaborator, if one is configured
//! 7. Release the workspace
//!
//! Only container creation and grouping setup are fatal to the unit. Everything else
//! fails per file or per record set and is collected as a [`StepIssue`] in the
//! returned [`UnitOutcome`]; the pool logs the outcome once.

use crate::catalog::{
    Category, PARTITION_KEY_FIELD, RecordType, import_name, partition_key, target_name,
};
use crate::enrich::Enricher;
use crate::planner::{UnitId, WorkUnit};
use crate::pool::CancelToken;
use crate::store::{CursorRow, FeatureStore, FieldDef, GeometryKind, RecordSetPath, SchemaPolicy};
use crate::workspace::WorkspaceHandle;
use anyhow::{Context, Result, ensure};
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

/// Worker processing step, used to label issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    Container,
    Groupings,
    Import,
    PartitionKey,
    Template,
    Append,
    Enrich,
}

impl Display for Step {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        let s = match self {
            Step::Container => "container",
            Step::Groupings => "groupings",
            Step::Import => "import",
            Step::PartitionKey => "partition-key",
            Step::Template => "template",
            Step::Append => "append",
            Step::Enrich => "enrich",
        };
        f.write_str(s)
    }
}

/// A non-fatal failure inside one step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepIssue {
    pub step: Step,
    /// File or record set the step was working on.
    pub subject: String,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitStatus {
    Succeeded,
    Failed { reason: String },
    /// The unit was not started, or stopped between steps, because the run
    /// was cancelled.
    Cancelled,
}

/// Everything a worker reports back for one unit.
#[derive(Clone, Debug)]
pub struct UnitOutcome {
    pub unit: UnitId,
    pub container: PathBuf,
    pub status: UnitStatus,
    pub issues: Vec<StepIssue>,
    pub imported: usize,
    /// Files whose record set already existed.
    pub skipped: usize,
    pub elapsed: Duration,
}

impl UnitOutcome {
    fn empty(unit: &WorkUnit, status: UnitStatus) -> Self {
        Self {
            unit: unit.id,
            container: unit.container.clone(),
            status,
            issues: Vec::new(),
            imported: 0,
            skipped: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Outcome for a unit that never ran because the run was cancelled.
    #[must_use]
    pub fn cancelled(unit: &WorkUnit) -> Self {
        Self::empty(unit, UnitStatus::Cancelled)
    }

    /// Outcome for a unit that failed outside the worker (e.g. a panic).
    #[must_use]
    pub fn failed(unit: &WorkUnit, reason: impl Into<String>) -> Self {
        Self::empty(
            unit,
            UnitStatus::Failed {
                reason: reason.into(),
            },
        )
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == UnitStatus::Succeeded
    }
}

/// Ensure one grouping per category exists in `container`, verifying each
/// creation.
///
/// # Errors
///
/// Returns an error if a grouping cannot be created or is missing afterwards.
pub fn ensure_groupings(
    store: &dyn FeatureStore,
    container: &Path,
    spatial_reference: u32,
) -> Result<()> {
    for category in Category::ALL {
        let name = category.grouping_name();
        if store.grouping_exists(container, name) {
            continue;
        }
        store
            .create_grouping(container, name, spatial_reference)
            .with_context(|| format!("create grouping {name} in {}", container.display()))?;
        ensure!(
            store.grouping_exists(container, name),
            "grouping {name} missing after creation in {}",
            container.display()
        );
        debug!(grouping = name, container = %container.display(), "created grouping");
    }
    Ok(())
}

enum Halt {
    Cancelled,
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for Halt {
    fn from(e: anyhow::Error) -> Self {
        Halt::Failed(e)
    }
}

fn checkpoint(cancel: &CancelToken) -> std::result::Result<(), Halt> {
    if cancel.is_cancelled() {
        Err(Halt::Cancelled)
    } else {
        Ok(())
    }
}

#[derive(Default)]
struct UnitRun {
    issues: Vec<StepIssue>,
    imported: usize,
    skipped: usize,
}

impl UnitRun {
    fn issue(&mut self, step: Step, subject: impl Display, error: impl Display) {
        self.issues.push(StepIssue {
            step,
            subject: subject.to_string(),
            error: format!("{error:#}"),
        });
    }

    fn check<T>(&mut self, step: Step, subject: impl Display, result: Result<T>) {
        if let Err(e) = result {
            self.issue(step, subject, e);
        }
    }
}

/// Processes work units into intermediate containers.
#[derive(Clone)]
pub struct ChunkWorker {
    store: Arc<dyn FeatureStore>,
    enricher: Option<Arc<dyn Enricher>>,
    spatial_reference: u32,
}

impl ChunkWorker {
    pub fn new(store: Arc<dyn FeatureStore>, spatial_reference: u32) -> Self {
        Self {
            store,
            enricher: None,
            spatial_reference,
        }
    }

    #[must_use]
    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Build `unit.container` from the unit's files. Never panics on store
    /// failures; they end up in the returned outcome.
    pub fn process(&self, unit: &WorkUnit, cancel: &CancelToken) -> UnitOutcome {
        let span = info_span!("chunk", unit = %unit.id);
        let _enter = span.enter();
        let start = Instant::now();
        info!(files = unit.files.len(), bytes = unit.total_bytes(), container = %unit.container.display(), "processing work unit");

        let mut run = UnitRun::default();
        let mut ws = WorkspaceHandle::new();
        let status = match self.build(unit, &mut ws, cancel, &mut run) {
            Ok(()) => UnitStatus::Succeeded,
            Err(Halt::Cancelled) => UnitStatus::Cancelled,
            Err(Halt::Failed(e)) => UnitStatus::Failed {
                reason: format!("{e:#}"),
            },
        };

        UnitOutcome {
            unit: unit.id,
            container: unit.container.clone(),
            status,
            issues: run.issues,
            imported: run.imported,
            skipped: run.skipped,
            elapsed: start.elapsed(),
        }
    }

    fn build(
        &self,
        unit: &WorkUnit,
        ws: &mut WorkspaceHandle,
        cancel: &CancelToken,
        run: &mut UnitRun,
    ) -> std::result::Result<(), Halt> {
        checkpoint(cancel)?;
        let store = self.store.as_ref();
        if !store.container_exists(&unit.container) {
            store
                .create_container(&unit.container)
                .with_context(|| format!("{} step", Step::Container))?;
        }

        let scope = ws.enter(&unit.container);
        ensure_groupings(store, &unit.container, self.spatial_reference)
            .with_context(|| format!("{} step", Step::Groupings))?;
        checkpoint(cancel)?;

        self.import_files(&scope, unit, run);
        checkpoint(cancel)?;

        let result = self.stamp_partition_keys(&scope, run);
        run.check(Step::PartitionKey, unit.container.display(), result);
        checkpoint(cancel)?;

        let categories = [unit.id.category];
        let result = self.create_targets(&scope, &categories, run);
        run.check(Step::Template, unit.container.display(), result);
        checkpoint(cancel)?;

        let result = self.append_sources(&scope, &categories, run);
        run.check(Step::Append, unit.container.display(), result);
        checkpoint(cancel)?;

        if let Some(enricher) = &self.enricher {
            match enricher.enrich(store, &unit.container, &categories, &RecordType::ALL) {
                Ok(report) => {
                    debug!(record_sets = report.record_sets, rows = report.rows_updated, "enriched");
                    for (name, error) in report.failures {
                        run.issue(Step::Enrich, name, error);
                    }
                }
                Err(e) => run.issue(Step::Enrich, unit.container.display(), e),
            }
        }

        drop(scope);
        ws.clear();
        Ok(())
    }

    fn import_files(&self, ws: &WorkspaceHandle, unit: &WorkUnit, run: &mut UnitRun) {
        for file in &unit.files {
            let subject = file.path.display();
            let Some(name) = import_name(&file.path) else {
                run.issue(Step::Import, subject, "file name has no usable stem");
                continue;
            };
            let target = match ws.resolve(None, &name) {
                Ok(t) => t,
                Err(e) => {
                    run.issue(Step::Import, subject, e);
                    continue;
                }
            };
            if self.store.record_set_exists(&target) {
                debug!(record_set = %name, "already imported; skipping");
                run.skipped += 1;
                continue;
            }
            match self.store.import_file(&file.path, &target) {
                Ok(rows) => {
                    debug!(record_set = %name, rows, "imported");
                    run.imported += 1;
                }
                Err(e) => run.issue(Step::Import, subject, e),
            }
        }
    }

    fn stamp_partition_keys(&self, ws: &WorkspaceHandle, run: &mut UnitRun) -> Result<()> {
        for name in self.store.list_record_sets(ws.container()?, None)? {
            let Some(key) = partition_key(&name) else {
                run.issue(Step::PartitionKey, &name, "no partition key in record set name");
                continue;
            };
            let rs = ws.resolve(None, &name)?;
            let result = self.stamp(&rs, key);
            run.check(Step::PartitionKey, &name, result);
        }
        Ok(())
    }

    fn stamp(&self, rs: &RecordSetPath, key: i64) -> Result<u64> {
        let has_field = self
            .store
            .list_fields(rs)?
            .iter()
            .any(|f| f.name.eq_ignore_ascii_case(PARTITION_KEY_FIELD));
        if !has_field {
            self.store.add_field(rs, &FieldDef::long(PARTITION_KEY_FIELD))?;
        }
        self.store
            .update_rows(rs, &[PARTITION_KEY_FIELD], &mut |row: &mut CursorRow<'_>| {
                if row.get(0).as_i64() == Some(key) {
                    return Ok(false);
                }
                row.set(0, key);
                Ok(true)
            })
    }

    /// First root record set matching `record_type`; point-only types prefer
    /// a template with point geometry.
    fn find_template(
        &self,
        ws: &WorkspaceHandle,
        sources: &[String],
        record_type: RecordType,
    ) -> Result<Option<RecordSetPath>> {
        let matches: Vec<&String> = sources.iter().filter(|n| record_type.matches(n)).collect();
        let Some(first) = matches.first() else {
            return Ok(None);
        };
        if record_type.is_point_only() {
            for name in &matches {
                let rs = ws.resolve(None, name)?;
                if matches!(self.store.describe_geometry(&rs), Ok(GeometryKind::Point)) {
                    return Ok(Some(rs));
                }
            }
            warn!(%record_type, template = %first, "no point template found; using first match");
        }
        Ok(Some(ws.resolve(None, first)?))
    }

    fn create_targets(
        &self,
        ws: &WorkspaceHandle,
        categories: &[Category],
        run: &mut UnitRun,
    ) -> Result<()> {
        let sources = self.store.list_record_sets(ws.container()?, None)?;
        for &category in categories {
            for record_type in RecordType::ALL {
                let name = target_name(category, record_type);
                let target = ws.resolve(Some(category.grouping_name()), &name)?;
                if self.store.record_set_exists(&target) {
                    continue;
                }
                let template = match self.find_template(ws, &sources, record_type) {
                    Ok(Some(t)) => t,
                    Ok(None) => continue,
                    Err(e) => {
                        run.issue(Step::Template, &name, e);
                        continue;
                    }
                };
                let result =
                    self.store
                        .create_record_set(&target, &template, self.spatial_reference);
                if result.is_ok() {
                    debug!(record_set = %name, template = %template.name, "created target");
                }
                run.check(Step::Template, &name, result);
            }
        }
        Ok(())
    }

    fn append_sources(
        &self,
        ws: &WorkspaceHandle,
        categories: &[Category],
        run: &mut UnitRun,
    ) -> Result<()> {
        let sources = self.store.list_record_sets(ws.container()?, None)?;
        for &category in categories {
            for record_type in RecordType::ALL {
                let name = target_name(category, record_type);
                let target = ws.resolve(Some(category.grouping_name()), &name)?;
                if !self.store.record_set_exists(&target) {
                    continue;
                }
                let result = self.append_into(ws, &sources, &target, record_type);
                run.check(Step::Append, &name, result);
            }
        }
        Ok(())
    }

    fn append_into(
        &self,
        ws: &WorkspaceHandle,
        sources: &[String],
        target: &RecordSetPath,
        record_type: RecordType,
    ) -> Result<u64> {
        // A populated target was filled by an earlier run of this unit.
        if self.store.count_rows(target)? > 0 {
            debug!(record_set = %target.name, "target already populated; skipping append");
            return Ok(0);
        }
        let kind = self.store.describe_geometry(target)?;
        let mut matching = Vec::new();
        for name in sources
            .iter()
            .filter(|n| record_type.matches(n) && **n != target.name)
        {
            let rs = ws.resolve(None, name)?;
            if matches!(self.store.describe_geometry(&rs), Ok(k) if k == kind) {
                matching.push(rs);
            }
        }
        if matching.is_empty() {
            return Ok(0);
        }
        let rows = self.store.append(&matching, target, SchemaPolicy::NoTest)?;
        debug!(record_set = %target.name, sources = matching.len(), rows, "appended");
        Ok(rows)
    }
}
