//! Fixed cadastral vocabulary: categories, record types and naming rules.
//!
//! Every name the pipeline derives from a file or folder goes through the pure
//! functions in this module, so the positional conventions of the source data
//! live in exactly one place:
//!
//! - [`classify_folder`] reads the two-letter category code at characters `[3, 5)`
//! - [`import_name`] turns a file stem into an imported record set name
//! - [`partition_key`] reads the municipal code at characters `[1, 6)` of that name
//! - [`target_name`] builds the `{category}_{recordType}` output name

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::path::Path;
use std::str::FromStr;

/// Field stamped onto every imported record with the municipal partition key.
pub const PARTITION_KEY_FIELD: &str = "Codigo_Municipal_Catastral";

/// WGS 84 / UTM zone 28N, the reference the cadastral exports ship in.
pub const DEFAULT_SPATIAL_REFERENCE: u32 = 32628;

/// Top-level territorial classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    Rustico,
    Urbano,
}

impl Category {
    /// All categories, in the order output is produced.
    pub const ALL: [Category; 2] = [Category::Rustico, Category::Urbano];

    /// Grouping and record-set prefix inside a container.
    #[must_use]
    pub const fn grouping_name(self) -> &'static str {
        match self {
            Category::Rustico => "Rustico",
            Category::Urbano => "Urbano",
        }
    }

    /// Directory name used by the ingest stage.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Category::Rustico => "Rústico",
            Category::Urbano => "Urbano",
        }
    }

    /// Two-letter code embedded in downloaded folder names.
    #[must_use]
    pub const fn folder_code(self) -> &'static str {
        match self {
            Category::Rustico => "RA",
            Category::Urbano => "UA",
        }
    }

    /// Single-letter prefix used for chunk identifiers.
    #[must_use]
    pub const fn unit_prefix(self) -> char {
        match self {
            Category::Rustico => 'R',
            Category::Urbano => 'U',
        }
    }

    /// Infer a category from a directory path, accepting the accented and
    /// plain spellings.
    #[must_use]
    pub fn from_dir(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        match name {
            "Rústico" | "Rustico" => Some(Category::Rustico),
            "Urbano" => Some(Category::Urbano),
            _ => None,
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.write_str(self.grouping_name())
    }
}

/// Cadastral feature kinds produced per category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordType {
    Altipun,
    Constru,
    Ejes,
    Elemlin,
    Elempun,
    Elemtex,
    Hojas,
    Limites,
    Mapa,
    Masa,
    Parcela,
    Subparce,
}

impl RecordType {
    pub const ALL: [RecordType; 12] = [
        RecordType::Altipun,
        RecordType::Constru,
        RecordType::Ejes,
        RecordType::Elemlin,
        RecordType::Elempun,
        RecordType::Elemtex,
        RecordType::Hojas,
        RecordType::Limites,
        RecordType::Mapa,
        RecordType::Masa,
        RecordType::Parcela,
        RecordType::Subparce,
    ];

    /// Upper-case code as it appears in source file names.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            RecordType::Altipun => "ALTIPUN",
            RecordType::Constru => "CONSTRU",
            RecordType::Ejes => "EJES",
            RecordType::Elemlin => "ELEMLIN",
            RecordType::Elempun => "ELEMPUN",
            RecordType::Elemtex => "ELEMTEX",
            RecordType::Hojas => "HOJAS",
            RecordType::Limites => "LIMITES",
            RecordType::Mapa => "MAPA",
            RecordType::Masa => "MASA",
            RecordType::Parcela => "PARCELA",
            RecordType::Subparce => "SUBPARCE",
        }
    }

    /// Whether templates for this type must carry point geometry.
    #[must_use]
    pub const fn is_point_only(self) -> bool {
        matches!(self, RecordType::Altipun)
    }

    /// Case-insensitive substring match against a record set name.
    #[must_use]
    pub fn matches(self, record_set_name: &str) -> bool {
        record_set_name.to_ascii_uppercase().contains(self.code())
    }
}

impl Display for RecordType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.write_str(self.code())
    }
}

impl FromStr for RecordType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        RecordType::ALL
            .into_iter()
            .find(|t| t.code() == upper)
            .ok_or_else(|| anyhow::anyhow!("unknown record type: {s}"))
    }
}

/// Output record set name for a `(category, recordType)` pair.
#[must_use]
pub fn target_name(category: Category, record_type: RecordType) -> String {
    format!("{}_{}", category.grouping_name(), record_type.code())
}

/// Every `(category, recordType)` pair in fixed output order.
pub fn all_targets() -> impl Iterator<Item = (Category, RecordType)> {
    Category::ALL
        .into_iter()
        .flat_map(|c| RecordType::ALL.into_iter().map(move |t| (c, t)))
}

/// Classify a downloaded folder by the code at characters `[3, 5)`.
///
/// ```
/// use geomerge::catalog::{classify_folder, Category};
///
/// assert_eq!(classify_folder("35_UA_2024"), Some(Category::Urbano));
/// assert_eq!(classify_folder("35_RA_2024"), Some(Category::Rustico));
/// assert_eq!(classify_folder("35_XX"), None);
/// assert_eq!(classify_folder("35"), None);
/// ```
#[must_use]
pub fn classify_folder(folder_name: &str) -> Option<Category> {
    let code: String = folder_name.chars().skip(3).take(2).collect();
    if code.chars().count() < 2 {
        return None;
    }
    Category::ALL.into_iter().find(|c| c.folder_code() == code)
}

/// Record set name an imported file receives.
///
/// Names must start with a letter inside a container, so stems get a `T`
/// prefix unless they already carry one.
#[must_use]
pub fn import_name(file: &Path) -> Option<String> {
    let stem = file.file_stem()?.to_str()?;
    if stem.starts_with('T') {
        Some(stem.to_string())
    } else {
        Some(format!("T{stem}"))
    }
}

/// Municipal partition key at characters `[1, 6)` of an imported record set name.
///
/// ```
/// use geomerge::catalog::partition_key;
///
/// assert_eq!(partition_key("T35001_PARCELA"), Some(35001));
/// assert_eq!(partition_key("Tabc12_PARCELA"), None);
/// assert_eq!(partition_key("T35"), None);
/// ```
#[must_use]
pub fn partition_key(record_set_name: &str) -> Option<i64> {
    let digits: String = record_set_name.chars().skip(1).take(5).collect();
    if digits.len() != 5 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Partition key for a source file, taken from its would-be import name.
#[must_use]
pub fn file_partition_key(file: &Path) -> Option<i64> {
    import_name(file).as_deref().and_then(partition_key)
}
