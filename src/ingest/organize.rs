//! Sort extracted folders into category directories.
//!
//! Extracted downloads are folders whose name carries a category code at
//! characters `[3, 5)` (see [`classify_folder`]), e.g. `35_UA_2024`. Each
//! municipality sub-directory of such a folder is moved into
//! `output/Rústico` or `output/Urbano`. A sub-directory that already exists at
//! the destination is merged entry by entry without overwriting.
//!
//! Files arriving in a category directory are prefixed with the first seven
//! characters of their directory name plus `_`, so file stems start with the
//! municipal code the import step reads. Archives are never renamed and a file
//! that already carries the prefix is left as is.
//!
//! Anything else left at the top of the output directory is removed.

use crate::catalog::{Category, classify_folder};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Summary of one organize run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OrganizeReport {
    /// Directories moved into a category directory.
    pub moved: Vec<PathBuf>,
    /// Destination directories that received merged entries.
    pub merged: Vec<PathBuf>,
    pub renamed: usize,
    /// Top-level leftovers removed at the end.
    pub removed: Vec<PathBuf>,
}

/// Prefix for files in `dir`: the first seven characters of its name plus `_`.
#[must_use]
pub fn file_prefix(dir: &Path) -> Option<String> {
    let name = dir.file_name()?.to_str()?;
    let head: String = name.chars().take(7).collect();
    Some(format!("{head}_"))
}

fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"))
}

/// Organizes an output directory into category directories.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileOrganizer;

impl FileOrganizer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Organize `base` in place.
    ///
    /// # Errors
    ///
    /// Returns an error if a category directory cannot be created or a
    /// directory cannot be listed. Individual moves and renames that fail are
    /// logged and skipped.
    pub fn organize(&self, base: &Path) -> Result<OrganizeReport> {
        let mut report = OrganizeReport::default();
        for category in Category::ALL {
            let dir = base.join(category.dir_name());
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        }

        self.visit(base, base, &mut report)?;

        for entry in fs::read_dir(base).with_context(|| format!("list {}", base.display()))? {
            let path = entry?.path();
            if !path.is_dir() || Category::from_dir(&path).is_some() {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => report.removed.push(path),
                Err(e) => warn!(dir = %path.display(), error = %e, "leftover directory not removed"),
            }
        }

        info!(
            moved = report.moved.len(),
            merged = report.merged.len(),
            renamed = report.renamed,
            removed = report.removed.len(),
            "organized input folders"
        );
        Ok(report)
    }

    fn visit(&self, base: &Path, dir: &Path, report: &mut OrganizeReport) -> Result<()> {
        let mut children: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("list {}", dir.display()))?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        children.sort();

        for child in children {
            if dir == base && Category::from_dir(&child).is_some() {
                continue;
            }
            let category = child
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(classify_folder);
            match category {
                Some(category) => {
                    let target = base.join(category.dir_name());
                    debug!(folder = %child.display(), %category, "classified folder");
                    self.move_contents(&child, &target, report)?;
                }
                None => self.visit(base, &child, report)?,
            }
        }
        Ok(())
    }

    fn move_contents(&self, source: &Path, target: &Path, report: &mut OrganizeReport) -> Result<()> {
        let mut subdirs: Vec<PathBuf> = fs::read_dir(source)
            .with_context(|| format!("list {}", source.display()))?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        subdirs.sort();

        for src in subdirs {
            let Some(name) = src.file_name() else {
                continue;
            };
            let dst = target.join(name);
            if dst.exists() {
                self.merge_into(&src, &dst, report);
                report.merged.push(dst);
                continue;
            }
            if let Err(e) = fs::rename(&src, &dst) {
                warn!(from = %src.display(), to = %dst.display(), error = %e, "move failed");
                continue;
            }
            report.renamed += prefix_files(&dst);
            report.moved.push(dst);
        }
        Ok(())
    }

    fn merge_into(&self, src: &Path, dst: &Path, report: &mut OrganizeReport) {
        let Ok(entries) = fs::read_dir(src) else {
            return;
        };
        let prefix = file_prefix(dst);
        for entry in entries.flatten() {
            let from = entry.path();
            let Some(name) = from.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let renamed = match &prefix {
                Some(p) if from.is_file() && !is_archive(&from) && !name.starts_with(p.as_str()) => {
                    format!("{p}{name}")
                }
                _ => name.to_string(),
            };
            let to = dst.join(&renamed);
            if to.exists() {
                continue;
            }
            match fs::rename(&from, &to) {
                Ok(()) if renamed != name => report.renamed += 1,
                Ok(()) => {}
                Err(e) => warn!(from = %from.display(), to = %to.display(), error = %e, "move failed"),
            }
        }
    }
}

/// Prefix the files directly inside `dir`. Returns how many were renamed.
fn prefix_files(dir: &Path) -> usize {
    let Some(prefix) = file_prefix(dir) else {
        return 0;
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut renamed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !path.is_file() || is_archive(&path) || name.starts_with(&prefix) {
            continue;
        }
        let to = dir.join(format!("{prefix}{name}"));
        match fs::rename(&path, &to) {
            Ok(()) => renamed += 1,
            Err(e) => warn!(file = %path.display(), error = %e, "rename failed"),
        }
    }
    renamed
}
