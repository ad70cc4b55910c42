//! Fatal pipeline errors.
//!
//! Only conditions that leave no useful output are errors here. Recoverable
//! failures (a missing input directory, a failed unit, a failed merge of one
//! record set, a temp directory that survives cleanup) are reported as data on
//! the corresponding report types instead.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Every dispatched work unit failed (or none were dispatched).
    #[error("no chunks processed successfully ({total} dispatched)")]
    NoSuccessfulUnits { total: usize },

    /// The final container could not be created or verified.
    #[error("final container {path} unusable: {reason}")]
    FinalContainer { path: PathBuf, reason: String },

    /// The run was cancelled before merging.
    #[error("pipeline cancelled before merge")]
    Cancelled,

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Any other unrecoverable failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for pipeline-level operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
