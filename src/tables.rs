//! Consolidation of standalone cadastral attribute tables.
//!
//! Besides shapefiles, the downloads carry `.dbf` tables without geometry:
//! street catalogues (`*_Carvia.dbf`) and rural crop and sub-parcel tables
//! (`*_RUCULTIVO.dbf`, `*_RUSUBPARCELA.dbf`). Each one is imported into the
//! root of the final container as `{category}_{table}_{code}`, stamped with its
//! municipal code in [`MUNICIPAL_CODE_FIELD`] (and reference metadata when a
//! table is configured), then unioned into one table per target:
//!
//! | target | sources |
//! | --- | --- |
//! | `Urbano_Carvia` | street tables of urban municipalities |
//! | `Rustico_Carvia` | street tables of rural municipalities |
//! | `Rustico_RUCULTIVO` | every crop table |
//! | `Rustico_RUSUBPARCELA` | every sub-parcel table |
//!
//! Per-municipality tables are deleted once their target is written. Failures
//! are reported per file or per target and never stop the others.

use crate::catalog::Category;
use crate::enrich::ReferenceTableEnricher;
use crate::planner::discover;
use crate::store::{CursorRow, FeatureStore, FieldDef, RecordSetPath};
use crate::workspace::WorkspaceHandle;
use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// LONG field holding the municipal code read from the table's file name.
pub const MUNICIPAL_CODE_FIELD: &str = "COD_MUNI";

/// Kind of standalone table, recognized by its file name suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableKind {
    Carvia,
    Cultivo,
    Subparcela,
}

impl TableKind {
    pub const ALL: [TableKind; 3] = [TableKind::Carvia, TableKind::Cultivo, TableKind::Subparcela];

    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            TableKind::Carvia => "Carvia",
            TableKind::Cultivo => "RUCULTIVO",
            TableKind::Subparcela => "RUSUBPARCELA",
        }
    }

    /// Crop and sub-parcel tables only exist for rural land.
    #[must_use]
    pub const fn fixed_category(self) -> Option<Category> {
        match self {
            TableKind::Carvia => None,
            TableKind::Cultivo | TableKind::Subparcela => Some(Category::Rustico),
        }
    }

    /// Match `*_{code}.dbf`, ignoring case.
    ///
    /// ```
    /// use geomerge::tables::TableKind;
    ///
    /// assert_eq!(TableKind::from_file_name("38001UA_Carvia.dbf"), Some(TableKind::Carvia));
    /// assert_eq!(TableKind::from_file_name("35001ra_rucultivo.DBF"), Some(TableKind::Cultivo));
    /// assert_eq!(TableKind::from_file_name("35001_MASA.dbf"), None);
    /// ```
    #[must_use]
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let lower = file_name.to_ascii_lowercase();
        Self::ALL.into_iter().find(|kind| {
            lower.ends_with(&format!("_{}.dbf", kind.code().to_ascii_lowercase()))
        })
    }
}

impl Display for TableKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.write_str(self.code())
    }
}

/// Consolidated tables in output order.
pub const TABLE_TARGETS: [(Category, TableKind); 4] = [
    (Category::Urbano, TableKind::Carvia),
    (Category::Rustico, TableKind::Carvia),
    (Category::Rustico, TableKind::Cultivo),
    (Category::Rustico, TableKind::Subparcela),
];

#[must_use]
pub fn table_name(category: Category, kind: TableKind) -> String {
    format!("{}_{}", category.grouping_name(), kind.code())
}

/// Leading digits of a file name.
///
/// ```
/// use geomerge::tables::municipal_code;
///
/// assert_eq!(municipal_code("35001RA_RUCULTIVO.dbf"), Some(35001));
/// assert_eq!(municipal_code("RA_RUCULTIVO.dbf"), None);
/// ```
#[must_use]
pub fn municipal_code(file_name: &str) -> Option<i64> {
    let digits: String = file_name.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Category from the first `RA`/`UA` code in a file name, ignoring case.
#[must_use]
pub fn table_category(file_name: &str) -> Option<Category> {
    file_name.as_bytes().windows(2).find_map(|pair| {
        match (pair[0].to_ascii_lowercase(), pair[1].to_ascii_lowercase()) {
            (b'r', b'a') => Some(Category::Rustico),
            (b'u', b'a') => Some(Category::Urbano),
            _ => None,
        }
    })
}

/// Whether `name` is a per-municipality table, `{target}_{code}`.
fn is_staging_name(name: &str) -> bool {
    let Some((prefix, code)) = name.rsplit_once('_') else {
        return false;
    };
    !code.is_empty()
        && code.bytes().all(|b| b.is_ascii_digit())
        && TABLE_TARGETS
            .iter()
            .any(|&(category, kind)| table_name(category, kind) == prefix)
}

/// A table file or target that could not be processed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableFailure {
    pub subject: String,
    pub error: String,
}

#[derive(Clone, Debug, Default)]
pub struct TableReport {
    /// Per-municipality tables imported this run.
    pub imported: Vec<String>,
    /// Targets written.
    pub merged: Vec<String>,
    /// Targets left by an earlier run that had no tables this time.
    pub removed: Vec<String>,
    pub failures: Vec<TableFailure>,
    pub rows: u64,
}

pub struct TableConsolidator {
    store: Arc<dyn FeatureStore>,
    reference: Option<ReferenceTableEnricher>,
}

impl TableConsolidator {
    pub fn new(store: Arc<dyn FeatureStore>) -> Self {
        Self {
            store,
            reference: None,
        }
    }

    /// Also add the reference metadata fields, looked up by municipal code.
    #[must_use]
    pub fn with_reference(mut self, reference: ReferenceTableEnricher) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Import every recognized table below `dirs` into `container` and
    /// consolidate them. `container` must already exist.
    pub fn consolidate(
        &self,
        ws: &mut WorkspaceHandle,
        dirs: &[(Category, PathBuf)],
        container: &Path,
    ) -> TableReport {
        let mut report = TableReport::default();
        let scope = ws.enter(container);
        self.drop_leftovers(container, &mut report);

        let mut staged: BTreeMap<String, Vec<RecordSetPath>> = BTreeMap::new();
        for (category, dir) in dirs {
            if !dir.is_dir() {
                debug!(dir = %dir.display(), "no table directory");
                continue;
            }
            let files = match discover(dir, *category, "dbf") {
                Ok(files) => files,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %format!("{e:#}"), "table discovery failed");
                    report.failures.push(TableFailure {
                        subject: dir.display().to_string(),
                        error: format!("{e:#}"),
                    });
                    continue;
                }
            };
            for file in files {
                self.stage_file(&scope, *category, &file.path, &mut staged, &mut report);
            }
        }

        for (category, kind) in TABLE_TARGETS {
            let name = table_name(category, kind);
            let inputs = staged.remove(&name).unwrap_or_default();
            self.reduce_target(&scope, &name, &inputs, &mut report);
        }
        drop(scope);

        info!(
            imported = report.imported.len(),
            merged = report.merged.len(),
            failed = report.failures.len(),
            rows = report.rows,
            "table consolidation complete"
        );
        report
    }

    /// Per-municipality tables left behind by an interrupted run.
    fn drop_leftovers(&self, container: &Path, report: &mut TableReport) {
        let store = self.store.as_ref();
        let names = match store.list_record_sets(container, None) {
            Ok(names) => names,
            Err(e) => {
                report.failures.push(TableFailure {
                    subject: container.display().to_string(),
                    error: format!("{e:#}"),
                });
                return;
            }
        };
        for name in names.into_iter().filter(|n| is_staging_name(n)) {
            let rs = RecordSetPath::new(container, None, &name);
            if let Err(e) = store.delete_record_set(&rs) {
                report.failures.push(TableFailure {
                    subject: name,
                    error: format!("{e:#}"),
                });
            }
        }
    }

    fn stage_file(
        &self,
        ws: &WorkspaceHandle,
        dir_category: Category,
        path: &Path,
        staged: &mut BTreeMap<String, Vec<RecordSetPath>>,
        report: &mut TableReport,
    ) {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        let Some(kind) = TableKind::from_file_name(file_name) else {
            return;
        };
        let Some(code) = municipal_code(file_name) else {
            warn!(file = %path.display(), "no municipal code in table name; skipping");
            return;
        };
        let category = kind
            .fixed_category()
            .or_else(|| table_category(file_name))
            .unwrap_or(dir_category);
        let target = table_name(category, kind);
        let name = format!("{target}_{code}");

        let result = ws
            .resolve(None, &name)
            .and_then(|rs| self.import(path, &rs, code).map(|rows| (rs, rows)));
        match result {
            Ok((rs, rows)) => {
                debug!(table = %name, rows, "imported table");
                let inputs = staged.entry(target).or_default();
                if !inputs.contains(&rs) {
                    inputs.push(rs);
                }
                report.imported.push(name);
            }
            Err(e) => {
                warn!(file = %path.display(), error = %format!("{e:#}"), "table import failed");
                report.failures.push(TableFailure {
                    subject: path.display().to_string(),
                    error: format!("{e:#}"),
                });
            }
        }
    }

    fn import(&self, source: &Path, rs: &RecordSetPath, code: i64) -> Result<u64> {
        let store = self.store.as_ref();
        if store.record_set_exists(rs) {
            store.delete_record_set(rs)?;
        }
        let rows = store.import_table(source, rs)?;

        if store
            .list_fields(rs)?
            .iter()
            .any(|f| f.name.eq_ignore_ascii_case(MUNICIPAL_CODE_FIELD))
        {
            store.delete_field(rs, MUNICIPAL_CODE_FIELD)?;
        }
        store.add_field(rs, &FieldDef::long(MUNICIPAL_CODE_FIELD))?;
        store.update_rows(rs, &[MUNICIPAL_CODE_FIELD], &mut |row: &mut CursorRow<'_>| {
            row.set(0, code);
            Ok(true)
        })?;

        if let Some(reference) = &self.reference {
            reference.enrich_record_set(store, rs, MUNICIPAL_CODE_FIELD)?;
        }
        Ok(rows)
    }

    fn reduce_target(
        &self,
        ws: &WorkspaceHandle,
        name: &str,
        inputs: &[RecordSetPath],
        report: &mut TableReport,
    ) {
        let store = self.store.as_ref();
        let result = ws.resolve(None, name).and_then(|target| {
            let existed = store.record_set_exists(&target);
            if existed {
                store.delete_record_set(&target)?;
            }
            if inputs.is_empty() {
                return Ok((existed, None));
            }
            Ok((existed, Some(store.merge(inputs, &target)?)))
        });
        match result {
            Ok((_, Some(rows))) => {
                info!(table = %name, sources = inputs.len(), rows, "tables merged");
                report.rows += rows;
                report.merged.push(name.to_string());
            }
            Ok((true, None)) => {
                info!(table = %name, "no tables; removed target from an earlier run");
                report.removed.push(name.to_string());
            }
            Ok((false, None)) => debug!(table = %name, "no tables"),
            Err(e) => {
                warn!(table = %name, error = %format!("{e:#}"), "table merge failed");
                report.failures.push(TableFailure {
                    subject: name.to_string(),
                    error: format!("{e:#}"),
                });
                // Per-municipality tables stay for inspection.
                return;
            }
        }

        for rs in inputs {
            if let Err(e) = store.delete_record_set(rs) {
                report.failures.push(TableFailure {
                    subject: rs.to_string(),
                    error: format!("{e:#}"),
                });
            }
        }
    }
}
