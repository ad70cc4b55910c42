//! Parallel extraction of downloaded cadastral archives.
//!
//! Each top-level `.zip` in the input directory wraps a single nested archive.
//! For `input/NAME.zip` the extractor:
//!
//! 1. unpacks it into `output/NAME/temp_extracted`
//! 2. unpacks the nested archive found there into `output/NAME`
//! 3. removes `temp_extracted`
//! 4. unpacks every `.zip` below `output/NAME` into its own folder and deletes it
//!
//! Archives are processed concurrently on a rayon pool. A corrupt archive or a
//! split archive (`.z01`) is reported and skipped; it never stops the others.

use anyhow::{Context, Result, anyhow};
use glob::{MatchOptions, Pattern, glob_with};
use rayon::prelude::*;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::ZipArchive;

const TEMP_EXTRACT_DIR: &str = "temp_extracted";

/// Summary of one extraction run.
#[derive(Clone, Debug, Default)]
pub struct ExtractReport {
    /// Output directories that received a nested archive.
    pub extracted: Vec<PathBuf>,
    /// Top-level archives without a nested archive inside.
    pub empty: Vec<PathBuf>,
    /// Split archives, which are not supported.
    pub unsupported: Vec<PathBuf>,
    /// `(archive, error)` for archives that could not be unpacked.
    pub failures: Vec<(PathBuf, String)>,
}

enum ArchiveOutcome {
    Extracted {
        dir: PathBuf,
        failures: Vec<(PathBuf, String)>,
    },
    Empty,
    Unsupported(PathBuf),
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Unpack `archive` into `dest`, creating it if needed.
///
/// # Errors
///
/// Returns an error if the archive cannot be opened, is not a valid zip
/// file, or an entry cannot be written.
pub fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let mut zip =
        ZipArchive::new(file).with_context(|| format!("invalid archive {}", archive.display()))?;
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    zip.extract(dest)
        .with_context(|| format!("extract {} into {}", archive.display(), dest.display()))
}

/// Unpack every `.zip` below `dir` next to itself and delete it. Returns the
/// archives that failed.
///
/// # Errors
///
/// Returns an error only if `dir` cannot be searched.
pub fn extract_nested(dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    let base = dir
        .to_str()
        .ok_or_else(|| anyhow!("non UTF-8 directory: {}", dir.display()))?;
    let pattern = format!("{}/**/*.zip", Pattern::escape(base));
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };
    let archives: Vec<PathBuf> = glob_with(&pattern, options)
        .with_context(|| format!("invalid glob pattern: {pattern}"))?
        .flatten()
        .filter(|p| p.is_file())
        .collect();

    Ok(archives
        .par_iter()
        .filter_map(|archive| {
            let folder = archive.parent()?;
            let result = unpack(archive, folder).and_then(|()| {
                fs::remove_file(archive).with_context(|| format!("remove {}", archive.display()))
            });
            match result {
                Ok(()) => {
                    debug!(archive = %archive.display(), "extracted nested archive");
                    None
                }
                Err(e) => {
                    warn!(archive = %archive.display(), error = %format!("{e:#}"), "nested archive skipped");
                    Some((archive.clone(), format!("{e:#}")))
                }
            }
        })
        .collect())
}

/// Extracts downloaded archives into the output directory.
#[derive(Clone, Debug, Default)]
pub struct ArchiveExtractor {
    threads: Option<usize>,
}

impl ArchiveExtractor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the extraction pool; defaults to rayon's choice.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads.max(1));
        self
    }

    /// Extract every top-level `.zip` in `input` into `output`.
    ///
    /// A missing `input` directory yields an empty report.
    ///
    /// # Errors
    ///
    /// Returns an error if `input` cannot be listed, `output` cannot be
    /// created, or the thread pool cannot be built.
    pub fn extract_all(&self, input: &Path, output: &Path) -> Result<ExtractReport> {
        let mut report = ExtractReport::default();
        if !input.is_dir() {
            warn!(input = %input.display(), "archive directory not found");
            return Ok(report);
        }
        let mut archives: Vec<PathBuf> = fs::read_dir(input)
            .with_context(|| format!("list {}", input.display()))?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && has_extension(p, "zip"))
            .collect();
        archives.sort();
        fs::create_dir_all(output).with_context(|| format!("create {}", output.display()))?;
        info!(input = %input.display(), archives = archives.len(), "extracting archives");

        let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("geomerge-unzip-{i}"));
        if let Some(n) = self.threads {
            builder = builder.num_threads(n);
        }
        let pool = builder.build().context("build extraction pool")?;
        let results: Vec<(PathBuf, Result<ArchiveOutcome>)> = pool.install(|| {
            archives
                .par_iter()
                .map(|archive| (archive.clone(), extract_archive(archive, output)))
                .collect()
        });

        for (archive, result) in results {
            match result {
                Ok(ArchiveOutcome::Extracted { dir, failures }) => {
                    info!(archive = %archive.display(), dir = %dir.display(), "archive extracted");
                    report.extracted.push(dir);
                    report.failures.extend(failures);
                }
                Ok(ArchiveOutcome::Empty) => {
                    warn!(archive = %archive.display(), "no nested archive found");
                    report.empty.push(archive);
                }
                Ok(ArchiveOutcome::Unsupported(nested)) => {
                    warn!(archive = %archive.display(), nested = %nested.display(), "split archives are not supported; skipping");
                    report.unsupported.push(archive);
                }
                Err(e) => {
                    warn!(archive = %archive.display(), error = %format!("{e:#}"), "archive skipped");
                    report.failures.push((archive, format!("{e:#}")));
                }
            }
        }
        Ok(report)
    }
}

fn extract_archive(archive: &Path, output: &Path) -> Result<ArchiveOutcome> {
    let stem = archive
        .file_stem()
        .ok_or_else(|| anyhow!("archive without a name: {}", archive.display()))?;
    let dir = output.join(stem);
    let temp = dir.join(TEMP_EXTRACT_DIR);

    let outcome = unpack_outer(archive, &temp, &dir);
    if temp.exists()
        && let Err(e) = fs::remove_dir_all(&temp)
    {
        debug!(dir = %temp.display(), error = %e, "temporary extraction directory left behind");
    }
    match outcome? {
        Some(nested) if has_extension(&nested, "z01") => Ok(ArchiveOutcome::Unsupported(nested)),
        Some(_) => {
            let failures = extract_nested(&dir)?;
            Ok(ArchiveOutcome::Extracted { dir, failures })
        }
        None => Ok(ArchiveOutcome::Empty),
    }
}

/// Unpack the outer archive into `temp` and its nested archive into `dir`.
/// Returns the nested archive found, if any. Split archives are returned
/// without being unpacked.
fn unpack_outer(archive: &Path, temp: &Path, dir: &Path) -> Result<Option<PathBuf>> {
    unpack(archive, temp)?;
    let mut nested: Vec<PathBuf> = fs::read_dir(temp)
        .with_context(|| format!("list {}", temp.display()))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && (has_extension(p, "zip") || has_extension(p, "z01")))
        .collect();
    nested.sort();
    let Some(first) = nested.into_iter().next() else {
        return Ok(None);
    };
    if has_extension(&first, "zip") {
        unpack(&first, dir)?;
    }
    Ok(Some(first))
}
