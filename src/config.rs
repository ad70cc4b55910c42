//! Pipeline configuration.
//!
//! A run is described by a JSON file with three required keys:
//!
//! ```json
//! {
//!   "input": "downloads/",
//!   "output": "work/",
//!   "gdb": "work/catastro.gdb",
//!   "reference_table": "cod_catastrales.json",
//!   "parallelism": { "policy": "cpu_fraction", "fraction": 0.7, "min_free": 2, "min_chunks": 2 },
//!   "cleanup": { "max_attempts": 3, "backoff_ms": 2000 },
//!   "consolidate_tables": true
//! }
//! ```
//!
//! `input` holds the downloaded archives, `output` receives the extracted and
//! organized category directories, and `gdb` is the final container. The
//! chunk working area lives next to the final container in
//! `temp_processing/chunks/`.

use crate::catalog::{Category, DEFAULT_SPATIAL_REFERENCE};
use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the working area created next to the final container.
pub const TEMP_DIR_NAME: &str = "temp_processing";
/// Sub-directory of the working area holding intermediate containers.
pub const CHUNK_DIR_NAME: &str = "chunks";

/// How many workers run concurrently and how many work units each category gets.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ParallelismPolicy {
    /// Explicit budget.
    Fixed {
        workers: usize,
        chunks_per_category: usize,
    },
    /// Use a fraction of the host CPUs while always leaving `min_free` idle.
    CpuFraction {
        fraction: f64,
        min_free: usize,
        min_chunks: usize,
    },
}

impl Default for ParallelismPolicy {
    fn default() -> Self {
        Self::CpuFraction {
            fraction: 0.70,
            min_free: 2,
            min_chunks: 2,
        }
    }
}

/// Resolved parallelism budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Parallelism {
    pub workers: usize,
    pub chunks_per_category: usize,
}

impl ParallelismPolicy {
    /// Resolve against the CPUs of this host.
    #[must_use]
    pub fn resolve(&self) -> Parallelism {
        self.resolve_for(num_cpus::get())
    }

    /// Resolve against an explicit CPU count.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn resolve_for(&self, cpus: usize) -> Parallelism {
        match *self {
            Self::Fixed {
                workers,
                chunks_per_category,
            } => Parallelism {
                workers: workers.max(1),
                chunks_per_category: chunks_per_category.max(1),
            },
            Self::CpuFraction {
                fraction,
                min_free,
                min_chunks,
            } => {
                let mut used = (cpus as f64 * fraction.clamp(0.0, 1.0)).floor() as usize;
                if cpus.saturating_sub(used) < min_free {
                    used = cpus.saturating_sub(min_free);
                }
                Parallelism {
                    workers: used.max(1),
                    chunks_per_category: (used / 2).max(min_chunks).max(1),
                }
            }
        }
    }
}

/// Retry budget for tearing down the working area.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 2000,
        }
    }
}

impl CleanupConfig {
    #[must_use]
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

fn default_source_extension() -> String {
    "shp".to_string()
}

fn default_spatial_reference() -> u32 {
    DEFAULT_SPATIAL_REFERENCE
}

/// Full description of a pipeline run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory holding the downloaded archives.
    pub input: PathBuf,
    /// Directory receiving the organized category directories.
    pub output: PathBuf,
    /// Final container path.
    pub gdb: PathBuf,
    /// JSON lookup table used for enrichment. Enrichment is skipped when unset.
    #[serde(default)]
    pub reference_table: Option<PathBuf>,
    #[serde(default = "default_source_extension")]
    pub source_extension: String,
    #[serde(default = "default_spatial_reference")]
    pub spatial_reference: u32,
    #[serde(default)]
    pub parallelism: ParallelismPolicy,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Abort outstanding work units after this many seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Also consolidate the standalone `.dbf` tables after the merge.
    #[serde(default)]
    pub consolidate_tables: bool,
}

impl PipelineConfig {
    /// Configuration with defaults for every optional key.
    pub fn new(
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        gdb: impl Into<PathBuf>,
    ) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            gdb: gdb.into(),
            reference_table: None,
            source_extension: default_source_extension(),
            spatial_reference: DEFAULT_SPATIAL_REFERENCE,
            parallelism: ParallelismPolicy::default(),
            cleanup: CleanupConfig::default(),
            timeout_secs: None,
            consolidate_tables: false,
        }
    }

    /// Load and validate a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, a required key is missing,
    /// or a value is out of range.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.source_extension.is_empty() && !self.source_extension.contains('.'),
            "source_extension must be a bare extension, got {:?}",
            self.source_extension
        );
        ensure!(
            self.cleanup.max_attempts > 0,
            "cleanup.max_attempts must be at least 1"
        );
        if let ParallelismPolicy::CpuFraction { fraction, .. } = self.parallelism {
            ensure!(
                fraction > 0.0 && fraction <= 1.0,
                "parallelism.fraction must be in (0, 1], got {fraction}"
            );
        }
        ensure!(
            self.gdb.file_name().is_some(),
            "gdb must name a container, got {}",
            self.gdb.display()
        );
        Ok(())
    }

    /// Input directory for each category, in fixed category order.
    #[must_use]
    pub fn category_dirs(&self) -> Vec<(Category, PathBuf)> {
        Category::ALL
            .into_iter()
            .map(|c| (c, self.output.join(c.dir_name())))
            .collect()
    }

    /// Root of the transient working area.
    #[must_use]
    pub fn temp_root(&self) -> PathBuf {
        self.gdb
            .parent()
            .map_or_else(|| PathBuf::from(TEMP_DIR_NAME), |p| p.join(TEMP_DIR_NAME))
    }

    /// Directory receiving intermediate containers.
    #[must_use]
    pub fn chunk_dir(&self) -> PathBuf {
        self.temp_root().join(CHUNK_DIR_NAME)
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}
