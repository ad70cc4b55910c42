//! Reference-metadata enrichment.
//!
//! After a worker has built its `{category}_{recordType}` record sets, an
//! [`Enricher`] stamps reference metadata onto every row. The shipped
//! implementation, [`ReferenceTableEnricher`], looks rows up by their
//! municipal partition key in a JSON table:
//!
//! ```json
//! [
//!   {
//!     "Codigo_Municipal_Catastral": 35001,
//!     "Nombre_Municipio": "Agaete",
//!     "Nombre_Isla": "Gran Canaria",
//!     "Codigo_Municipal_ISTAC": 35001,
//!     "Codigo_Isla_INE": 350
//!   }
//! ]
//! ```
//!
//! The four metadata fields are dropped and re-added on each record set so
//! reruns never accumulate stale columns. Rows whose key is not in the table
//! keep null metadata.

use crate::catalog::{Category, PARTITION_KEY_FIELD, RecordType, target_name};
use crate::store::{CursorRow, FeatureStore, FieldDef, RecordSetPath};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

pub const MUNICIPALITY_NAME_FIELD: &str = "Nombre_Municipio";
pub const ISLAND_NAME_FIELD: &str = "Nombre_Isla";
pub const ISTAC_CODE_FIELD: &str = "Codigo_Municipal_ISTAC";
pub const INE_ISLAND_CODE_FIELD: &str = "Codigo_Isla_INE";

/// Field definitions added by enrichment, in column order.
#[must_use]
pub fn enrichment_fields() -> [FieldDef; 4] {
    [
        FieldDef::text(MUNICIPALITY_NAME_FIELD, 255),
        FieldDef::text(ISLAND_NAME_FIELD, 50),
        FieldDef::long(ISTAC_CODE_FIELD),
        FieldDef::long(INE_ISLAND_CODE_FIELD),
    ]
}

/// Outcome of enriching one container.
#[derive(Clone, Debug, Default)]
pub struct EnrichReport {
    pub record_sets: usize,
    pub rows_updated: u64,
    /// `(record set, error)` for record sets that could not be enriched.
    pub failures: Vec<(String, String)>,
}

/// Populates reference metadata on existing output record sets.
pub trait Enricher: Send + Sync {
    /// # Errors
    ///
    /// Returns an error only when the container as a whole is unusable;
    /// per-record-set failures are reported in [`EnrichReport::failures`].
    fn enrich(
        &self,
        store: &dyn FeatureStore,
        container: &Path,
        categories: &[Category],
        record_types: &[RecordType],
    ) -> Result<EnrichReport>;
}

fn int_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
    }
    match Raw::deserialize(d)? {
        Raw::Int(i) => Ok(i),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// One row of the reference table.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct MunicipalityInfo {
    #[serde(rename = "Codigo_Municipal_Catastral", deserialize_with = "int_or_string")]
    pub code: i64,
    #[serde(rename = "Nombre_Municipio", default)]
    pub municipality: String,
    #[serde(rename = "Nombre_Isla", default)]
    pub island: String,
    #[serde(rename = "Codigo_Municipal_ISTAC", default)]
    pub istac_code: i64,
    #[serde(rename = "Codigo_Isla_INE", default)]
    pub ine_island_code: i64,
}

/// Municipal lookup table keyed by partition key.
#[derive(Clone, Debug, Default)]
pub struct ReferenceTable {
    entries: HashMap<i64, MunicipalityInfo>,
}

impl ReferenceTable {
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = MunicipalityInfo>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.code, e)).collect(),
        }
    }

    /// Load a JSON array of [`MunicipalityInfo`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            bail!("reference table not found: {}", path.display());
        }
        let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let entries: Vec<MunicipalityInfo> =
            serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
        Ok(Self::from_entries(entries))
    }

    #[must_use]
    pub fn get(&self, code: i64) -> Option<&MunicipalityInfo> {
        self.entries.get(&code)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// [`Enricher`] backed by a [`ReferenceTable`].
#[derive(Clone, Debug)]
pub struct ReferenceTableEnricher {
    table: ReferenceTable,
}

impl ReferenceTableEnricher {
    #[must_use]
    pub fn new(table: ReferenceTable) -> Self {
        Self { table }
    }

    fn reset_fields(store: &dyn FeatureStore, rs: &RecordSetPath) -> Result<()> {
        let defs = enrichment_fields();
        for existing in store.list_fields(rs)? {
            if defs.iter().any(|d| d.name.eq_ignore_ascii_case(&existing.name)) {
                store.delete_field(rs, &existing.name)?;
            }
        }
        for def in &defs {
            store.add_field(rs, def)?;
        }
        Ok(())
    }

    /// Re-add the metadata fields on `rs` and fill them by looking up each
    /// row's `key_field`. Returns the number of rows that matched.
    ///
    /// # Errors
    ///
    /// Returns an error if a field cannot be dropped, added or updated.
    pub fn enrich_record_set(
        &self,
        store: &dyn FeatureStore,
        rs: &RecordSetPath,
        key_field: &str,
    ) -> Result<u64> {
        Self::reset_fields(store, rs)?;
        self.update(store, rs, key_field)
    }

    fn update(&self, store: &dyn FeatureStore, rs: &RecordSetPath, key_field: &str) -> Result<u64> {
        const KEY: usize = 0;
        const NAME: usize = 1;
        const ISLAND: usize = 2;
        const ISTAC: usize = 3;
        const INE: usize = 4;

        let fields = [
            key_field,
            MUNICIPALITY_NAME_FIELD,
            ISLAND_NAME_FIELD,
            ISTAC_CODE_FIELD,
            INE_ISLAND_CODE_FIELD,
        ];
        store.update_rows(rs, &fields, &mut |row: &mut CursorRow<'_>| {
            let Some(info) = row.get(KEY).as_i64().and_then(|k| self.table.get(k)) else {
                return Ok(false);
            };
            row.set(NAME, info.municipality.as_str());
            row.set(ISLAND, info.island.as_str());
            row.set(ISTAC, info.istac_code);
            row.set(INE, info.ine_island_code);
            Ok(true)
        })
    }
}

impl Enricher for ReferenceTableEnricher {
    fn enrich(
        &self,
        store: &dyn FeatureStore,
        container: &Path,
        categories: &[Category],
        record_types: &[RecordType],
    ) -> Result<EnrichReport> {
        let mut report = EnrichReport::default();
        for &category in categories {
            for &record_type in record_types {
                let name = target_name(category, record_type);
                let rs = RecordSetPath::new(container, Some(category.grouping_name()), &name);
                if !store.record_set_exists(&rs) {
                    debug!(record_set = %rs, "no record set to enrich");
                    continue;
                }
                let result = self.enrich_record_set(store, &rs, PARTITION_KEY_FIELD);
                match result {
                    Ok(rows) => {
                        report.record_sets += 1;
                        report.rows_updated += rows;
                    }
                    Err(e) => {
                        warn!(record_set = %rs, error = %format!("{e:#}"), "enrichment failed");
                        report.failures.push((name, format!("{e:#}")));
                    }
                }
            }
        }
        Ok(report)
    }
}
