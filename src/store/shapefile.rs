//! Minimal ESRI shapefile reader.
//!
//! Reads the `.shp` main file and its sibling `.dbf` attribute table into a
//! [`Schema`] plus [`Record`]s. Standalone `.dbf` tables are read by
//! [`read_dbf`]. Only what the import step needs is decoded:
//!
//! - Shape types Null, Point, PolyLine, Polygon and MultiPoint, including the
//!   Z and M variants (read as XY; measures and elevations are dropped)
//! - dBASE field types `C`, `N`, `F`, `L` and `D`; other types are read as text
//! - Rows flagged as deleted in the `.dbf` are skipped together with their shape
//!
//! Text that is not valid UTF-8 is decoded as Latin-1, which is what the
//! cadastral exports use.

use crate::store::{FieldDef, FieldType, Geometry, GeometryKind, Record, Schema, Value};
use anyhow::{Context, Result, anyhow, bail, ensure};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::fs;
use std::io::Cursor;
use std::path::Path;

const SHP_FILE_CODE: i32 = 9994;
const SHP_HEADER_LEN: usize = 100;
const DBF_HEADER_TERMINATOR: u8 = 0x0D;
const DBF_DESCRIPTOR_LEN: usize = 32;

/// Decoded contents of one shapefile.
#[derive(Clone, Debug)]
pub struct ShapefileData {
    pub schema: Schema,
    pub records: Vec<Record>,
}

/// Map a shapefile shape type code to a geometry kind.
///
/// # Errors
///
/// Returns an error for unsupported codes (e.g. `MultiPatch`).
pub fn geometry_kind(shape_type: i32) -> Result<GeometryKind> {
    Ok(match shape_type {
        0 => GeometryKind::Null,
        1 | 11 | 21 => GeometryKind::Point,
        3 | 13 | 23 => GeometryKind::Polyline,
        5 | 15 | 25 => GeometryKind::Polygon,
        8 | 18 | 28 => GeometryKind::Multipoint,
        other => bail!("unsupported shape type {other}"),
    })
}

/// Read `path` (the `.shp` file) and its sibling `.dbf`, if present.
///
/// # Errors
///
/// Returns an error if either file is malformed or the row counts disagree.
pub fn read_shapefile(path: &Path) -> Result<ShapefileData> {
    let shp = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let (kind, geometries) =
        parse_shp(&shp).with_context(|| format!("parse {}", path.display()))?;

    let dbf_path = path.with_extension("dbf");
    let (fields, rows) = if dbf_path.is_file() {
        let dbf = fs::read(&dbf_path).with_context(|| format!("read {}", dbf_path.display()))?;
        parse_dbf(&dbf).with_context(|| format!("parse {}", dbf_path.display()))?
    } else {
        let rows = geometries.iter().map(|_| DbfRow::default()).collect();
        (Vec::new(), rows)
    };

    ensure!(
        rows.len() == geometries.len(),
        "{}: {} shapes but {} attribute rows",
        path.display(),
        geometries.len(),
        rows.len()
    );

    let records = geometries
        .into_iter()
        .zip(rows)
        .filter(|(_, row)| !row.deleted)
        .map(|(geometry, row)| Record {
            geometry,
            attributes: row.values,
        })
        .collect();

    Ok(ShapefileData {
        schema: Schema {
            geometry: kind,
            spatial_reference: None,
            fields,
        },
        records,
    })
}

/// Read a standalone dBASE table (no `.shp` sibling) as geometry-less rows.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is malformed.
pub fn read_dbf(path: &Path) -> Result<ShapefileData> {
    let dbf = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let (fields, rows) = parse_dbf(&dbf).with_context(|| format!("parse {}", path.display()))?;
    let records = rows
        .into_iter()
        .filter(|row| !row.deleted)
        .map(|row| Record {
            geometry: Geometry::Null,
            attributes: row.values,
        })
        .collect();
    Ok(ShapefileData {
        schema: Schema {
            geometry: GeometryKind::Null,
            spatial_reference: None,
            fields,
        },
        records,
    })
}

fn slice(buf: &[u8], off: usize, len: usize) -> Result<&[u8]> {
    buf.get(off..off + len)
        .ok_or_else(|| anyhow!("truncated at byte {off} (need {len} bytes)"))
}

fn count(cur: &mut Cursor<&[u8]>) -> Result<usize> {
    let n = cur.read_i32::<LittleEndian>()?;
    usize::try_from(n).map_err(|_| anyhow!("negative count {n}"))
}

fn points(cur: &mut Cursor<&[u8]>, n: usize) -> Result<Vec<[f64; 2]>> {
    (0..n)
        .map(|_| Ok([cur.read_f64::<LittleEndian>()?, cur.read_f64::<LittleEndian>()?]))
        .collect()
}

fn parse_shp(buf: &[u8]) -> Result<(GeometryKind, Vec<Geometry>)> {
    ensure!(buf.len() >= SHP_HEADER_LEN, "file shorter than shapefile header");
    let mut cur = Cursor::new(buf);
    let code = cur.read_i32::<BigEndian>()?;
    ensure!(code == SHP_FILE_CODE, "bad file code {code}");
    cur.set_position(32);
    let kind = geometry_kind(cur.read_i32::<LittleEndian>()?)?;

    let mut out = Vec::new();
    let mut off = SHP_HEADER_LEN;
    while off + 8 <= buf.len() {
        cur.set_position(u64::try_from(off + 4)?);
        let words = cur.read_i32::<BigEndian>()?;
        let len = usize::try_from(words)
            .map_err(|_| anyhow!("negative record length at byte {off}"))?
            * 2;
        let content = slice(buf, off + 8, len)?;
        out.push(parse_shape(content).with_context(|| format!("record at byte {off}"))?);
        off += 8 + len;
    }
    Ok((kind, out))
}

fn parse_shape(c: &[u8]) -> Result<Geometry> {
    let mut cur = Cursor::new(c);
    let shape_type = cur.read_i32::<LittleEndian>()?;
    let kind = geometry_kind(shape_type)?;
    if kind == GeometryKind::Null {
        return Ok(Geometry::Null);
    }
    if kind == GeometryKind::Point {
        let x = cur.read_f64::<LittleEndian>()?;
        let y = cur.read_f64::<LittleEndian>()?;
        return Ok(Geometry::Point { x, y });
    }

    // Skip the bounding box.
    cur.set_position(36);
    if kind == GeometryKind::Multipoint {
        let n = count(&mut cur)?;
        return Ok(Geometry::Multipoint {
            points: points(&mut cur, n)?,
        });
    }

    let num_parts = count(&mut cur)?;
    let num_points = count(&mut cur)?;
    let starts = (0..num_parts)
        .map(|_| count(&mut cur))
        .collect::<Result<Vec<_>>>()?;
    let all = points(&mut cur, num_points)?;
    let mut parts = Vec::with_capacity(num_parts);
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(num_points);
        ensure!(start <= end && end <= num_points, "bad part index {start}");
        parts.push(all[start..end].to_vec());
    }
    Ok(if kind == GeometryKind::Polygon {
        Geometry::Polygon { rings: parts }
    } else {
        Geometry::Polyline { parts }
    })
}

#[derive(Default)]
struct DbfRow {
    deleted: bool,
    values: Vec<Value>,
}

struct DbfField {
    def: FieldDef,
    kind: u8,
    length: usize,
}

fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

fn parse_dbf(buf: &[u8]) -> Result<(Vec<FieldDef>, Vec<DbfRow>)> {
    ensure!(buf.len() >= 32, "file shorter than dBASE header");
    let mut cur = Cursor::new(buf);
    cur.set_position(4);
    let record_count = usize::try_from(cur.read_u32::<LittleEndian>()?)?;
    let header_len = usize::from(cur.read_u16::<LittleEndian>()?);
    let record_len = usize::from(cur.read_u16::<LittleEndian>()?);
    ensure!(record_len > 0, "zero-length attribute rows");

    let mut fields = Vec::new();
    let mut off = 32;
    while off + DBF_DESCRIPTOR_LEN <= header_len && buf.get(off) != Some(&DBF_HEADER_TERMINATOR) {
        let d = slice(buf, off, DBF_DESCRIPTOR_LEN)?;
        let name_end = d[..11].iter().position(|&b| b == 0).unwrap_or(11);
        let name = decode_text(&d[..name_end]).trim().to_string();
        let kind = d[11];
        let length = usize::from(d[16]);
        let decimals = d[17];
        let field_type = match kind {
            b'C' => FieldType::Text,
            b'N' if decimals == 0 && length <= 18 => FieldType::Long,
            b'N' | b'F' => FieldType::Double,
            b'L' => FieldType::Boolean,
            b'D' => FieldType::Date,
            _ => FieldType::Text,
        };
        let def_len = (field_type == FieldType::Text).then_some(u32::from(d[16]));
        fields.push(DbfField {
            def: FieldDef::new(name, field_type, def_len),
            kind,
            length,
        });
        off += DBF_DESCRIPTOR_LEN;
    }

    let mut rows = Vec::with_capacity(record_count.min(buf.len() / record_len));
    for i in 0..record_count {
        let rec = slice(buf, header_len + i * record_len, record_len)
            .with_context(|| format!("attribute row {i}"))?;
        let deleted = rec[0] == b'*';
        let mut pos = 1;
        let mut values = Vec::with_capacity(fields.len());
        for f in &fields {
            let raw = slice(rec, pos, f.length)?;
            values.push(decode_value(f, raw));
            pos += f.length;
        }
        rows.push(DbfRow { deleted, values });
    }

    Ok((fields.into_iter().map(|f| f.def).collect(), rows))
}

fn decode_value(field: &DbfField, raw: &[u8]) -> Value {
    let text = decode_text(raw);
    match field.kind {
        b'C' => Value::Text(text.trim_end().to_string()),
        b'N' | b'F' => {
            let t = text.trim();
            if t.is_empty() || t.chars().all(|c| c == '*') {
                return Value::Null;
            }
            if field.def.field_type == FieldType::Long {
                t.parse().map_or(Value::Null, Value::Int)
            } else {
                t.parse().map_or(Value::Null, Value::Float)
            }
        }
        b'L' => match text.trim() {
            "T" | "t" | "Y" | "y" => Value::Bool(true),
            "F" | "f" | "N" | "n" => Value::Bool(false),
            _ => Value::Null,
        },
        b'D' => {
            let t = text.trim();
            if t.is_empty() {
                Value::Null
            } else {
                Value::Text(t.to_string())
            }
        }
        _ => Value::Text(text.trim().to_string()),
    }
}
