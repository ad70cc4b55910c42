//! Spatial feature store capability contract.
//!
//! The pipeline never touches store files directly. Everything goes through the
//! [`FeatureStore`] trait, which models a transactional container of groupings
//! and record sets:
//!
//! - **Containers** are durable or transient stores (one final, many intermediate)
//! - **Groupings** partition record sets inside a container and pin a spatial reference
//! - **Record sets** are schema-bound collections of [`Record`]s sharing one geometry kind
//!
//! Row updates go through [`FeatureStore::update_rows`], a scoped update cursor
//! that binds a [`RowAccessor`] once per record set schema and commits all rows
//! when the visitor returns.
//!
//! [`local::LocalStore`] is the filesystem-backed implementation shipped with
//! the crate.

pub mod local;
pub mod shapefile;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::path::{Path, PathBuf};

/// Fully qualified location of a record set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordSetPath {
    pub container: PathBuf,
    pub grouping: Option<String>,
    pub name: String,
}

impl RecordSetPath {
    pub fn new(container: impl AsRef<Path>, grouping: Option<&str>, name: &str) -> Self {
        Self {
            container: container.as_ref().to_path_buf(),
            grouping: grouping.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Same container and grouping, different name.
    #[must_use]
    pub fn sibling(&self, name: &str) -> Self {
        Self {
            container: self.container.clone(),
            grouping: self.grouping.clone(),
            name: name.to_string(),
        }
    }
}

impl Display for RecordSetPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        let mut path = self.container.clone();
        if let Some(g) = &self.grouping {
            path.push(g);
        }
        path.push(&self.name);
        write!(f, "{}", path.display())
    }
}

/// Geometry kind shared by every record in a record set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeometryKind {
    Null,
    Point,
    Multipoint,
    Polyline,
    Polygon,
}

impl Display for GeometryKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        let s = match self {
            GeometryKind::Null => "null",
            GeometryKind::Point => "point",
            GeometryKind::Multipoint => "multipoint",
            GeometryKind::Polyline => "polyline",
            GeometryKind::Polygon => "polygon",
        };
        f.write_str(s)
    }
}

/// Attribute column types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    Long,
    Double,
    Text,
    Date,
    Boolean,
}

/// Attribute column definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType, length: Option<u32>) -> Self {
        Self {
            name: name.into(),
            field_type,
            length,
        }
    }

    pub fn long(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Long, None)
    }

    pub fn double(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Double, None)
    }

    pub fn text(name: impl Into<String>, length: u32) -> Self {
        Self::new(name, FieldType::Text, Some(length))
    }
}

/// A single attribute value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of the value, accepting integral floats and numeric text.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Record geometry. Coordinates are carried, never interpreted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Geometry {
    Null,
    Point { x: f64, y: f64 },
    Multipoint { points: Vec<[f64; 2]> },
    Polyline { parts: Vec<Vec<[f64; 2]>> },
    Polygon { rings: Vec<Vec<[f64; 2]>> },
}

impl Geometry {
    #[must_use]
    pub fn kind(&self) -> GeometryKind {
        match self {
            Geometry::Null => GeometryKind::Null,
            Geometry::Point { .. } => GeometryKind::Point,
            Geometry::Multipoint { .. } => GeometryKind::Multipoint,
            Geometry::Polyline { .. } => GeometryKind::Polyline,
            Geometry::Polygon { .. } => GeometryKind::Polygon,
        }
    }
}

/// Record set schema: geometry kind, spatial reference and ordered fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub geometry: GeometryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial_reference: Option<u32>,
    pub fields: Vec<FieldDef>,
}

impl Schema {
    /// Position of a field, compared case-insensitively.
    #[must_use]
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.field_index(name).is_some()
    }
}

/// One row: geometry plus attribute values positional to the schema fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub geometry: Geometry,
    pub attributes: Vec<Value>,
}

/// How strictly [`FeatureStore::append`] checks source schemas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SchemaPolicy {
    /// Every target field must exist in each source with the same type.
    #[default]
    Test,
    /// Fields are mapped by name; target fields missing in a source become null.
    NoTest,
}

/// Name-to-position lookup bound once against a record set schema.
///
/// Cursor columns are addressed by their position in the requested field list;
/// the accessor maps each of them to the schema position at bind time so rows
/// are never searched by name.
#[derive(Clone, Debug)]
pub struct RowAccessor {
    positions: Vec<usize>,
    lookup: HashMap<String, usize>,
}

impl RowAccessor {
    /// Bind `fields` against `schema`.
    ///
    /// # Errors
    ///
    /// Returns an error if any requested field is missing from the schema.
    pub fn bind(schema: &Schema, fields: &[&str]) -> Result<Self> {
        let mut positions = Vec::with_capacity(fields.len());
        let mut lookup = HashMap::with_capacity(fields.len());
        for (i, name) in fields.iter().enumerate() {
            let pos = schema
                .field_index(name)
                .ok_or_else(|| anyhow!("field {name} not found in schema"))?;
            positions.push(pos);
            lookup.insert(name.to_ascii_lowercase(), i);
        }
        Ok(Self { positions, lookup })
    }

    /// Cursor column for a field name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<usize> {
        self.lookup.get(&name.to_ascii_lowercase()).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Mutable view of one row inside an update cursor.
pub struct CursorRow<'a> {
    accessor: &'a RowAccessor,
    record: &'a mut Record,
}

impl<'a> CursorRow<'a> {
    pub fn new(accessor: &'a RowAccessor, record: &'a mut Record) -> Self {
        Self { accessor, record }
    }

    /// Value of cursor column `col`.
    ///
    /// # Panics
    ///
    /// Panics if `col` is outside the bound field list.
    #[must_use]
    pub fn get(&self, col: usize) -> &Value {
        &self.record.attributes[self.accessor.positions[col]]
    }

    /// Overwrite cursor column `col`.
    ///
    /// # Panics
    ///
    /// Panics if `col` is outside the bound field list.
    pub fn set(&mut self, col: usize, value: impl Into<Value>) {
        self.record.attributes[self.accessor.positions[col]] = value.into();
    }

    #[must_use]
    pub fn accessor(&self) -> &RowAccessor {
        self.accessor
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.record.geometry
    }
}

/// Visitor invoked once per row by [`FeatureStore::update_rows`]. Returns
/// whether the row was modified.
pub type RowVisitor<'v> = dyn FnMut(&mut CursorRow<'_>) -> Result<bool> + 'v;

/// Capability contract of a spatial feature store.
///
/// Implementations must be safe to share across worker threads; isolation
/// between workers comes from each worker touching only its own container.
pub trait FeatureStore: Send + Sync {
    /// Create an empty container. Fails if one already exists at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be created.
    fn create_container(&self, path: &Path) -> Result<()>;

    fn container_exists(&self, path: &Path) -> bool;

    /// Create a grouping pinned to a spatial reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is missing or the grouping cannot be created.
    fn create_grouping(&self, container: &Path, name: &str, spatial_reference: u32)
    -> Result<()>;

    fn grouping_exists(&self, container: &Path, name: &str) -> bool;

    /// # Errors
    ///
    /// Returns an error if the container cannot be read.
    fn list_groupings(&self, container: &Path) -> Result<Vec<String>>;

    /// Convert a source file into a new record set. Returns the row count.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the target already exists.
    fn import_file(&self, source: &Path, target: &RecordSetPath) -> Result<u64>;

    /// Convert a standalone attribute table into a new record set without
    /// geometry. Returns the row count.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read or the target already exists.
    fn import_table(&self, source: &Path, target: &RecordSetPath) -> Result<u64>;

    fn record_set_exists(&self, path: &RecordSetPath) -> bool;

    /// Record set names directly inside `grouping` (or the container root),
    /// sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the container or grouping cannot be read.
    fn list_record_sets(&self, container: &Path, grouping: Option<&str>) -> Result<Vec<String>>;

    /// # Errors
    ///
    /// Returns an error if the record set cannot be read.
    fn describe_geometry(&self, path: &RecordSetPath) -> Result<GeometryKind>;

    /// # Errors
    ///
    /// Returns an error if the record set cannot be read.
    fn list_fields(&self, path: &RecordSetPath) -> Result<Vec<FieldDef>>;

    /// # Errors
    ///
    /// Returns an error if the record set cannot be read.
    fn count_rows(&self, path: &RecordSetPath) -> Result<u64>;

    /// Add a field, filling existing rows with null.
    ///
    /// # Errors
    ///
    /// Returns an error if the field already exists or the record set cannot be rewritten.
    fn add_field(&self, path: &RecordSetPath, field: &FieldDef) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if the field is missing or the record set cannot be rewritten.
    fn delete_field(&self, path: &RecordSetPath, name: &str) -> Result<()>;

    /// Create an empty record set with the schema of `template`.
    ///
    /// # Errors
    ///
    /// Returns an error if the template is unreadable or the target exists.
    fn create_record_set(
        &self,
        path: &RecordSetPath,
        template: &RecordSetPath,
        spatial_reference: u32,
    ) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if the record set cannot be removed.
    fn delete_record_set(&self, path: &RecordSetPath) -> Result<()>;

    /// Scoped update cursor over `fields`. Every row is visited and all
    /// modifications are committed together when iteration finishes. Returns
    /// the number of rows the visitor reported as modified.
    ///
    /// # Errors
    ///
    /// Returns an error if a field is missing, the visitor fails, or the
    /// record set cannot be rewritten. Nothing is committed on error.
    fn update_rows(
        &self,
        path: &RecordSetPath,
        fields: &[&str],
        visit: &mut RowVisitor<'_>,
    ) -> Result<u64>;

    /// Append all rows of `sources` into the existing `target`.
    ///
    /// # Errors
    ///
    /// Returns an error on geometry mismatch, schema mismatch under
    /// [`SchemaPolicy::Test`], or I/O failure. Nothing is committed on error.
    fn append(
        &self,
        sources: &[RecordSetPath],
        target: &RecordSetPath,
        policy: SchemaPolicy,
    ) -> Result<u64>;

    /// Union of `sources` written into a new `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if sources disagree on geometry kind or the target exists.
    fn merge(&self, sources: &[RecordSetPath], target: &RecordSetPath) -> Result<u64>;

    /// Copy `source` verbatim into a new `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is unreadable or the target exists.
    fn copy_record_set(&self, source: &RecordSetPath, target: &RecordSetPath) -> Result<u64>;

    /// Defragment and normalize a container.
    ///
    /// # Errors
    ///
    /// Returns an error if any record set cannot be rewritten.
    fn compact(&self, container: &Path) -> Result<()>;

    /// Drop any cached handles the store keeps on containers.
    fn clear_workspace_cache(&self);
}
