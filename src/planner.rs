//! Chunk planner: size-balanced partitioning of input files into work units.
//!
//! Planning runs in two passes per category:
//!
//! 1. **Discover** every file with the source extension beneath the category
//!    directory (recursively, case-insensitive extension match).
//! 2. **Balance** the files over a fixed number of units with the
//!    longest-processing-time-first heuristic: files are taken largest first
//!    and each goes to the unit with the smallest running byte total, ties
//!    going to the lowest unit index.
//!
//! Unit indices are offset per category (the first input directory occupies
//! `[0, C)`, the second `[C, 2C)`), so identifiers are unique across the whole
//! plan. Units that receive no files are dropped. A missing input directory is
//! not an error: it yields no files and a [`PlanningWarning`].

use crate::catalog::{Category, file_partition_key};
use anyhow::{Context, Result, anyhow};
use glob::{MatchOptions, Pattern, glob_with};
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One discovered source file. Immutable once discovered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputFile {
    pub path: PathBuf,
    pub size: u64,
    pub category: Category,
    /// Municipal code inferred from the file name, if it carries one.
    pub partition_key: Option<i64>,
}

/// Globally unique work unit identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId {
    pub category: Category,
    pub index: usize,
}

impl Display for UnitId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        write!(f, "{}{}", self.category.unit_prefix(), self.index)
    }
}

/// Files assigned to one worker plus the intermediate container it must build.
#[derive(Clone, Debug)]
pub struct WorkUnit {
    pub id: UnitId,
    pub files: Vec<InputFile>,
    pub container: PathBuf,
}

impl WorkUnit {
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Non-fatal planning conditions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanningWarning {
    MissingInputDir { category: Category, path: PathBuf },
}

impl Display for PlanningWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        match self {
            Self::MissingInputDir { category, path } => {
                write!(f, "input directory for {category} not found: {}", path.display())
            }
        }
    }
}

/// Result of planning: non-empty units in index order plus warnings.
#[derive(Clone, Debug, Default)]
pub struct ChunkPlan {
    pub units: Vec<WorkUnit>,
    pub warnings: Vec<PlanningWarning>,
}

impl ChunkPlan {
    /// Number of files across all units.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.units.iter().map(|u| u.files.len()).sum()
    }
}

/// Partition `items` into `bins` groups, minimizing the largest group total
/// with the longest-processing-time-first heuristic.
///
/// Deterministic for a fixed input order: the sort is stable and ties between
/// bins go to the lowest index. Always returns exactly `bins` groups (some may
/// be empty); `bins == 0` is treated as one bin.
///
/// ```
/// use geomerge::planner::balance;
///
/// let bins = balance(vec![100u64, 90, 80, 70, 60, 50, 40, 30, 20, 10], |s| *s, 4);
/// let totals: Vec<u64> = bins.iter().map(|b| b.iter().sum()).collect();
/// assert_eq!(totals, vec![150, 140, 130, 130]);
/// ```
pub fn balance<T>(mut items: Vec<T>, size: impl Fn(&T) -> u64, bins: usize) -> Vec<Vec<T>> {
    let bins = bins.max(1);
    items.sort_by_key(|item| std::cmp::Reverse(size(item)));

    let mut groups: Vec<Vec<T>> = (0..bins).map(|_| Vec::new()).collect();
    let mut totals = vec![0u64; bins];
    for item in items {
        let idx = totals
            .iter()
            .enumerate()
            .min_by_key(|&(i, total)| (*total, i))
            .map_or(0, |(i, _)| i);
        totals[idx] += size(&item);
        groups[idx].push(item);
    }
    groups
}

/// Recursively find files with `extension` under `dir`, sorted by path.
///
/// # Errors
///
/// Returns an error if the directory path is not valid UTF-8, the pattern is
/// invalid, or a matched entry cannot be inspected.
pub fn discover(dir: &Path, category: Category, extension: &str) -> Result<Vec<InputFile>> {
    let base = dir
        .to_str()
        .ok_or_else(|| anyhow!("non UTF-8 input directory: {}", dir.display()))?;
    let pattern = format!("{}/**/*.{extension}", Pattern::escape(base));
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };

    let mut files = Vec::new();
    for entry in
        glob_with(&pattern, options).with_context(|| format!("invalid glob pattern: {pattern}"))?
    {
        let path = entry.with_context(|| format!("error reading glob entry for {pattern}"))?;
        if !path.is_file() {
            continue;
        }
        let size = fs::metadata(&path)
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        let partition_key = file_partition_key(&path);
        files.push(InputFile {
            path,
            size,
            category,
            partition_key,
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// Builds a [`ChunkPlan`] from category input directories.
#[derive(Clone, Debug)]
pub struct ChunkPlanner {
    pub chunks_per_category: usize,
    pub extension: String,
    pub chunk_dir: PathBuf,
}

impl ChunkPlanner {
    pub fn new(
        chunks_per_category: usize,
        extension: impl Into<String>,
        chunk_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            chunks_per_category: chunks_per_category.max(1),
            extension: extension.into(),
            chunk_dir: chunk_dir.into(),
        }
    }

    /// Intermediate container path for a unit.
    #[must_use]
    pub fn container_path(&self, id: UnitId) -> PathBuf {
        self.chunk_dir.join(format!("chunk_{id}"))
    }

    /// Plan every `(category, directory)` input, in the given order.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery fails for an existing directory.
    pub fn plan(&self, inputs: &[(Category, PathBuf)]) -> Result<ChunkPlan> {
        let mut plan = ChunkPlan::default();
        for (position, (category, dir)) in inputs.iter().enumerate() {
            let offset = position * self.chunks_per_category;
            if !dir.is_dir() {
                warn!(%category, dir = %dir.display(), "input directory not found; category has no files");
                plan.warnings.push(PlanningWarning::MissingInputDir {
                    category: *category,
                    path: dir.clone(),
                });
                continue;
            }

            let files = discover(dir, *category, &self.extension)?;
            let total: u64 = files.iter().map(|f| f.size).sum();
            info!(%category, dir = %dir.display(), files = files.len(), bytes = total, offset, "discovered input files");

            for (i, group) in balance(files, |f| f.size, self.chunks_per_category)
                .into_iter()
                .enumerate()
            {
                if group.is_empty() {
                    continue;
                }
                let id = UnitId {
                    category: *category,
                    index: offset + i,
                };
                let unit = WorkUnit {
                    id,
                    files: group,
                    container: self.container_path(id),
                };
                #[allow(clippy::cast_precision_loss)]
                let mb = unit.total_bytes() as f64 / 1024.0 / 1024.0;
                info!(unit = %id, files = unit.files.len(), size_mb = format_args!("{mb:.2}"), "planned work unit");
                plan.units.push(unit);
            }
        }
        Ok(plan)
    }
}
