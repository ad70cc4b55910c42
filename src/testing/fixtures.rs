//! Fixture builders: synthetic shapefiles and temporary pipeline layouts.

use crate::catalog::Category;
use crate::config::{CleanupConfig, ParallelismPolicy, PipelineConfig};
use crate::store::{FieldDef, FieldType, Geometry, GeometryKind, Value};
use anyhow::{Context, Result, ensure};
use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const DEFAULT_TEXT_LEN: u32 = 50;
const LONG_LEN: u8 = 10;
const DOUBLE_LEN: u8 = 19;
const DOUBLE_DECIMALS: u8 = 6;

fn shape_type(kind: GeometryKind) -> i32 {
    match kind {
        GeometryKind::Null => 0,
        GeometryKind::Point => 1,
        GeometryKind::Polyline => 3,
        GeometryKind::Polygon => 5,
        GeometryKind::Multipoint => 8,
    }
}

/// Builds a shapefile (`.shp` + `.dbf`) in memory and writes it to disk.
#[derive(Clone, Debug)]
pub struct ShapefileWriter {
    kind: GeometryKind,
    fields: Vec<FieldDef>,
    rows: Vec<(Geometry, Vec<Value>, bool)>,
}

impl ShapefileWriter {
    #[must_use]
    pub fn new(kind: GeometryKind) -> Self {
        Self {
            kind,
            fields: Vec::new(),
            rows: Vec::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn long_field(self, name: &str) -> Self {
        self.field(FieldDef::long(name))
    }

    #[must_use]
    pub fn text_field(self, name: &str, length: u32) -> Self {
        self.field(FieldDef::text(name, length))
    }

    #[must_use]
    pub fn record(mut self, geometry: Geometry, values: Vec<Value>) -> Self {
        self.rows.push((geometry, values, false));
        self
    }

    /// A row flagged as deleted in the attribute table.
    #[must_use]
    pub fn deleted_record(mut self, geometry: Geometry, values: Vec<Value>) -> Self {
        self.rows.push((geometry, values, true));
        self
    }

    #[must_use]
    pub fn point(self, x: f64, y: f64, values: Vec<Value>) -> Self {
        self.record(Geometry::Point { x, y }, values)
    }

    /// Add `count` point rows whose single `ID` field runs from `first_id`.
    /// Expects exactly one LONG field.
    #[must_use]
    pub fn numbered_points(mut self, first_id: i64, count: usize) -> Self {
        for i in 0..count {
            let id = first_id + i64::try_from(i).unwrap_or(i64::MAX);
            #[allow(clippy::cast_precision_loss)]
            let x = id as f64;
            self = self.point(x, x * 2.0, vec![Value::Int(id)]);
        }
        self
    }

    /// A geometry-less row, for standalone tables written by [`Self::write_dbf`].
    #[must_use]
    pub fn row(self, values: Vec<Value>) -> Self {
        self.record(Geometry::Null, values)
    }

    fn check_rows(&self) -> Result<()> {
        for (i, (_, values, _)) in self.rows.iter().enumerate() {
            ensure!(
                values.len() == self.fields.len(),
                "row {i} has {} values for {} fields",
                values.len(),
                self.fields.len()
            );
        }
        Ok(())
    }

    /// Write `path` and its sibling `.dbf`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a row has the wrong number of values or a file
    /// cannot be written.
    pub fn write(&self, path: &Path) -> Result<()> {
        self.check_rows()?;
        create_parent(path)?;
        fs::write(path, self.shp_bytes()?).with_context(|| format!("write {}", path.display()))?;
        let dbf = path.with_extension("dbf");
        fs::write(&dbf, self.dbf_bytes()?).with_context(|| format!("write {}", dbf.display()))?;
        Ok(())
    }

    /// Write only the attribute table to `path`; geometries are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if a row has the wrong number of values or the file
    /// cannot be written.
    pub fn write_dbf(&self, path: &Path) -> Result<()> {
        self.check_rows()?;
        create_parent(path)?;
        fs::write(path, self.dbf_bytes()?).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    fn shp_bytes(&self) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        for (n, (geometry, _, _)) in self.rows.iter().enumerate() {
            let content = shape_content(geometry)?;
            body.write_i32::<BigEndian>(i32::try_from(n + 1).unwrap_or(i32::MAX))?;
            body.write_i32::<BigEndian>(words(content.len()))?;
            body.extend_from_slice(&content);
        }

        let mut out = Vec::with_capacity(100 + body.len());
        out.write_i32::<BigEndian>(9994)?;
        out.extend_from_slice(&[0u8; 20]);
        out.write_i32::<BigEndian>(words(100 + body.len()))?;
        out.write_i32::<LittleEndian>(1000)?;
        out.write_i32::<LittleEndian>(shape_type(self.kind))?;
        // Bounding box and Z/M ranges are left zeroed.
        out.extend_from_slice(&[0u8; 64]);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn dbf_layout(&self) -> Vec<(u8, u8, u8)> {
        self.fields
            .iter()
            .map(|f| match f.field_type {
                FieldType::Text => {
                    let len = f.length.unwrap_or(DEFAULT_TEXT_LEN).clamp(1, 254);
                    (b'C', u8::try_from(len).unwrap_or(254), 0)
                }
                FieldType::Long => (b'N', LONG_LEN, 0),
                FieldType::Double => (b'N', DOUBLE_LEN, DOUBLE_DECIMALS),
                FieldType::Boolean => (b'L', 1, 0),
                FieldType::Date => (b'D', 8, 0),
            })
            .collect()
    }

    fn dbf_bytes(&self) -> io::Result<Vec<u8>> {
        let layout = self.dbf_layout();
        let header_len = 32 + 32 * layout.len() + 1;
        let record_len = 1 + layout.iter().map(|(_, len, _)| usize::from(*len)).sum::<usize>();

        let mut out = Vec::new();
        out.write_u8(0x03)?;
        out.extend_from_slice(&[124, 1, 1]);
        out.write_u32::<LittleEndian>(u32::try_from(self.rows.len()).unwrap_or(u32::MAX))?;
        out.write_u16::<LittleEndian>(u16::try_from(header_len).unwrap_or(u16::MAX))?;
        out.write_u16::<LittleEndian>(u16::try_from(record_len).unwrap_or(u16::MAX))?;
        out.extend_from_slice(&[0u8; 20]);

        for (field, (kind, len, decimals)) in self.fields.iter().zip(&layout) {
            let mut name = [0u8; 11];
            let bytes = field.name.as_bytes();
            let n = bytes.len().min(10);
            name[..n].copy_from_slice(&bytes[..n]);
            out.extend_from_slice(&name);
            out.write_u8(*kind)?;
            out.extend_from_slice(&[0u8; 4]);
            out.write_u8(*len)?;
            out.write_u8(*decimals)?;
            out.extend_from_slice(&[0u8; 14]);
        }
        out.write_u8(0x0D)?;

        for (_, values, deleted) in &self.rows {
            out.write_u8(if *deleted { b'*' } else { b' ' })?;
            for (value, (kind, len, decimals)) in values.iter().zip(&layout) {
                out.extend_from_slice(&encode_value(value, *kind, usize::from(*len), *decimals));
            }
        }
        out.write_u8(0x1A)?;
        Ok(out)
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    Ok(())
}

fn words(bytes: usize) -> i32 {
    i32::try_from(bytes / 2).unwrap_or(i32::MAX)
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn push_points(out: &mut Vec<u8>, points: &[[f64; 2]]) -> io::Result<()> {
    for [x, y] in points {
        out.write_f64::<LittleEndian>(*x)?;
        out.write_f64::<LittleEndian>(*y)?;
    }
    Ok(())
}

fn shape_content(geometry: &Geometry) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    out.write_i32::<LittleEndian>(shape_type(geometry.kind()))?;
    match geometry {
        Geometry::Null => {}
        Geometry::Point { x, y } => push_points(&mut out, &[[*x, *y]])?,
        Geometry::Multipoint { points } => {
            out.extend_from_slice(&[0u8; 32]);
            out.write_i32::<LittleEndian>(count(points.len()))?;
            push_points(&mut out, points)?;
        }
        Geometry::Polyline { parts } | Geometry::Polygon { rings: parts } => {
            out.extend_from_slice(&[0u8; 32]);
            out.write_i32::<LittleEndian>(count(parts.len()))?;
            out.write_i32::<LittleEndian>(count(parts.iter().map(Vec::len).sum()))?;
            let mut start = 0;
            for part in parts {
                out.write_i32::<LittleEndian>(count(start))?;
                start += part.len();
            }
            for part in parts {
                push_points(&mut out, part)?;
            }
        }
    }
    Ok(out)
}

fn encode_value(value: &Value, kind: u8, len: usize, decimals: u8) -> Vec<u8> {
    let text = match (value, kind) {
        (Value::Null, _) => String::new(),
        (Value::Bool(b), _) => String::from(if *b { "T" } else { "F" }),
        #[allow(clippy::cast_precision_loss)]
        (Value::Int(i), b'N') if decimals > 0 => {
            format!("{:.*}", usize::from(decimals), *i as f64)
        }
        (Value::Int(i), _) => i.to_string(),
        (Value::Float(f), _) => format!("{:.*}", usize::from(decimals), f),
        (Value::Text(s), _) => s.clone(),
    };
    let mut bytes: Vec<u8> = text.into_bytes();
    bytes.truncate(len);
    let pad = len - bytes.len();
    if kind == b'N' {
        let mut out = vec![b' '; pad];
        out.extend_from_slice(&bytes);
        out
    } else {
        bytes.resize(len, b' ');
        bytes
    }
}

/// Temporary directory laid out like a pipeline run:
///
/// ```text
/// <tmp>/downloads/        archives
/// <tmp>/work/Rústico/     organized input
/// <tmp>/work/Urbano/
/// <tmp>/db/final.gdb      final container
/// ```
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    /// # Errors
    ///
    /// Returns an error if the temporary directory cannot be created.
    pub fn new() -> Result<Self> {
        let dir = TempDir::new().context("create temp dir")?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    #[must_use]
    pub fn input_dir(&self) -> PathBuf {
        self.root().join("downloads")
    }

    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.root().join("work")
    }

    #[must_use]
    pub fn category_dir(&self, category: Category) -> PathBuf {
        self.output_dir().join(category.dir_name())
    }

    #[must_use]
    pub fn rustico_dir(&self) -> PathBuf {
        self.category_dir(Category::Rustico)
    }

    #[must_use]
    pub fn urbano_dir(&self) -> PathBuf {
        self.category_dir(Category::Urbano)
    }

    #[must_use]
    pub fn gdb(&self) -> PathBuf {
        self.root().join("db").join("final.gdb")
    }

    /// Configuration for this layout: fixed parallelism and no cleanup backoff.
    #[must_use]
    pub fn config(&self, workers: usize, chunks_per_category: usize) -> PipelineConfig {
        let mut config = PipelineConfig::new(self.input_dir(), self.output_dir(), self.gdb());
        config.parallelism = ParallelismPolicy::Fixed {
            workers,
            chunks_per_category,
        };
        config.cleanup = CleanupConfig {
            max_attempts: 3,
            backoff_ms: 0,
        };
        config
    }

    /// Write a point shapefile `{stem}.shp` with `rows` numbered rows into
    /// `{category dir}/{stem[..5]}/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be written.
    pub fn add_points(
        &self,
        category: Category,
        stem: &str,
        first_id: i64,
        rows: usize,
    ) -> Result<PathBuf> {
        let folder: String = stem.chars().take(5).collect();
        let path = self
            .category_dir(category)
            .join(folder)
            .join(format!("{stem}.shp"));
        ShapefileWriter::new(GeometryKind::Point)
            .long_field("ID")
            .numbered_points(first_id, rows)
            .write(&path)?;
        Ok(path)
    }
}
