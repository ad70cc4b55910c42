//! Bounded parallel execution of work units.
//!
//! Units run on a dedicated rayon pool sized to the worker budget, so at most
//! `workers` units are active at once. Every unit runs to completion (or is
//! recorded as cancelled); a panicking worker is caught here and recorded as a
//! failed unit without affecting its siblings.

use crate::error::{PipelineError, Result};
use crate::planner::WorkUnit;
use crate::worker::{ChunkWorker, UnitOutcome, UnitStatus};
use anyhow::anyhow;
use rayon::prelude::*;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

/// Shared cancellation signal with an optional deadline.
///
/// Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that trips by itself once `timeout` has elapsed.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
            || self.inner.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Outcomes of every dispatched unit, in plan order.
#[derive(Clone, Debug, Default)]
pub struct PoolReport {
    pub outcomes: Vec<UnitOutcome>,
}

impl PoolReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, UnitStatus::Failed { .. }))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

fn run_unit(worker: &ChunkWorker, unit: &WorkUnit, cancel: &CancelToken) -> UnitOutcome {
    if cancel.is_cancelled() {
        return UnitOutcome::cancelled(unit);
    }
    catch_unwind(AssertUnwindSafe(|| worker.process(unit, cancel))).unwrap_or_else(|payload| {
        UnitOutcome::failed(unit, format!("panic: {}", panic_message(payload.as_ref())))
    })
}

fn log_outcome(outcome: &UnitOutcome) {
    let secs = outcome.elapsed.as_secs_f64();
    match &outcome.status {
        UnitStatus::Succeeded => info!(
            unit = %outcome.unit,
            imported = outcome.imported,
            skipped = outcome.skipped,
            issues = outcome.issues.len(),
            secs,
            "work unit succeeded"
        ),
        UnitStatus::Failed { reason } => {
            warn!(unit = %outcome.unit, %reason, secs, "work unit failed");
        }
        UnitStatus::Cancelled => warn!(unit = %outcome.unit, "work unit cancelled"),
    }
    for issue in &outcome.issues {
        warn!(
            unit = %outcome.unit,
            step = %issue.step,
            subject = %issue.subject,
            error = %issue.error,
            "step failed"
        );
    }
}

/// Runs [`ChunkWorker`]s over work units with a fixed concurrency bound.
#[derive(Clone, Copy, Debug)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Process every unit and block until all have returned.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Cancelled`] if any unit was stopped by `cancel`
    /// - [`PipelineError::NoSuccessfulUnits`] if no unit succeeded
    /// - [`PipelineError::Other`] if the thread pool cannot be built
    pub fn run(
        &self,
        worker: &ChunkWorker,
        units: &[WorkUnit],
        cancel: &CancelToken,
    ) -> Result<PoolReport> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("geomerge-worker-{i}"))
            .build()
            .map_err(|e| anyhow!("build worker pool: {e}"))?;

        info!(units = units.len(), workers = self.workers, "dispatching work units");
        let outcomes: Vec<UnitOutcome> = pool.install(|| {
            units
                .par_iter()
                .map(|unit| run_unit(worker, unit, cancel))
                .collect()
        });
        outcomes.iter().for_each(log_outcome);

        let report = PoolReport { outcomes };
        let succeeded = report.succeeded().count();
        let failed = report.failed().count();
        info!(total = units.len(), succeeded, failed, "worker pool drained");

        // A deadline that passes after the last unit finished is not a cancellation.
        if report
            .outcomes
            .iter()
            .any(|o| o.status == UnitStatus::Cancelled)
        {
            return Err(PipelineError::Cancelled);
        }
        if succeeded == 0 {
            return Err(PipelineError::NoSuccessfulUnits { total: units.len() });
        }
        Ok(report)
    }
}
