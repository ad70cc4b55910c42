//! Filesystem-backed [`FeatureStore`].
//!
//! Layout on disk:
//!
//! ```text
//! final.gdb/                    container (marked by container.json)
//!   container.json
//!   T35001_PARCELA.jsonl        record set at the container root
//!   Rustico/                    grouping (marked by grouping.json)
//!     grouping.json
//!     Rustico_PARCELA.jsonl     record set inside a grouping
//!     Rustico_PARCELA.lock      present only while the record set is being rewritten
//! ```
//!
//! A record set file is JSON Lines: the first line is the [`Schema`] header and
//! every following non-empty line is one [`Record`]. Rewrites go through a
//! temporary file and a rename, guarded by a `.lock` marker that is removed
//! when the write finishes. Copies are plain file copies, so a copied record
//! set is byte-for-byte identical to its source.

use crate::store::shapefile::{read_dbf, read_shapefile};
use crate::store::{
    CursorRow, FeatureStore, FieldDef, GeometryKind, Record, RecordSetPath, RowAccessor,
    RowVisitor, Schema, SchemaPolicy, Value,
};
use anyhow::{Context, Result, anyhow, bail, ensure};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions, create_dir_all, read_dir, remove_file, rename};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

const CONTAINER_MARKER: &str = "container.json";
const GROUPING_MARKER: &str = "grouping.json";
const RECORD_SET_EXT: &str = "jsonl";
const LOCK_EXT: &str = "lock";

#[derive(Serialize, Deserialize)]
struct ContainerMarker {
    format: String,
    version: u32,
}

#[derive(Serialize, Deserialize)]
struct GroupingMarker {
    spatial_reference: u32,
}

/// Holds a record set's `.lock` marker for the duration of a write.
struct LockMarker {
    path: PathBuf,
}

impl LockMarker {
    fn acquire(path: PathBuf) -> Result<Self> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("record set locked: {}", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for LockMarker {
    fn drop(&mut self) {
        remove_file(&self.path).ok();
    }
}

/// Feature store keeping containers as directories of JSON Lines record sets.
#[derive(Default)]
pub struct LocalStore {
    schema_cache: Mutex<HashMap<PathBuf, Schema>>,
}

impl LocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn grouping_dir(container: &Path, grouping: Option<&str>) -> PathBuf {
        match grouping {
            Some(g) => container.join(g),
            None => container.to_path_buf(),
        }
    }

    /// File backing a record set.
    #[must_use]
    pub fn record_set_file(path: &RecordSetPath) -> PathBuf {
        Self::grouping_dir(&path.container, path.grouping.as_deref())
            .join(format!("{}.{RECORD_SET_EXT}", path.name))
    }

    fn lock_file(path: &RecordSetPath) -> PathBuf {
        Self::grouping_dir(&path.container, path.grouping.as_deref())
            .join(format!("{}.{LOCK_EXT}", path.name))
    }

    fn validate_name(name: &str) -> Result<()> {
        ensure!(!name.is_empty(), "empty name");
        ensure!(
            !name.contains(['/', '\\']) && name != "." && name != "..",
            "invalid name: {name}"
        );
        Ok(())
    }

    /// Fail unless the container and grouping of `path` exist.
    fn check_parent(&self, path: &RecordSetPath) -> Result<()> {
        Self::validate_name(&path.name)?;
        ensure!(
            self.container_exists(&path.container),
            "container not found: {}",
            path.container.display()
        );
        if let Some(g) = &path.grouping {
            ensure!(
                self.grouping_exists(&path.container, g),
                "grouping {g} not found in {}",
                path.container.display()
            );
        }
        Ok(())
    }

    fn check_new(&self, path: &RecordSetPath) -> Result<()> {
        self.check_parent(path)?;
        ensure!(!self.record_set_exists(path), "record set already exists: {path}");
        Ok(())
    }

    fn invalidate(&self, file: &Path) {
        self.schema_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(file);
    }

    fn grouping_spatial_reference(&self, path: &RecordSetPath) -> Option<u32> {
        let g = path.grouping.as_deref()?;
        let marker = path.container.join(g).join(GROUPING_MARKER);
        let text = std::fs::read_to_string(marker).ok()?;
        serde_json::from_str::<GroupingMarker>(&text)
            .ok()
            .map(|m| m.spatial_reference)
    }

    /// Read only the schema header of a record set.
    ///
    /// # Errors
    ///
    /// Returns an error if the record set is missing or its header is malformed.
    pub fn read_schema(&self, path: &RecordSetPath) -> Result<Schema> {
        let file = Self::record_set_file(path);
        if let Some(s) = self
            .schema_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&file)
        {
            return Ok(s.clone());
        }
        let f = File::open(&file).with_context(|| format!("open {}", file.display()))?;
        let mut first = String::new();
        BufReader::new(f)
            .read_line(&mut first)
            .with_context(|| format!("read header of {}", file.display()))?;
        let schema: Schema = serde_json::from_str(first.trim())
            .with_context(|| format!("parse header of {}", file.display()))?;
        self.schema_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(file, schema.clone());
        Ok(schema)
    }

    /// Read a record set's schema and all of its rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or any line fails to parse.
    pub fn read_record_set(&self, path: &RecordSetPath) -> Result<(Schema, Vec<Record>)> {
        let file = Self::record_set_file(path);
        let f = File::open(&file).with_context(|| format!("open {}", file.display()))?;
        let mut lines = BufReader::new(f).lines().enumerate();
        let schema: Schema = match lines.next() {
            Some((_, line)) => {
                let line = line.with_context(|| format!("read header of {}", file.display()))?;
                serde_json::from_str(line.trim())
                    .with_context(|| format!("parse header of {}", file.display()))?
            }
            None => bail!("{} has no schema header", file.display()),
        };
        let mut records = Vec::new();
        for (i, line) in lines {
            let line = line.with_context(|| format!("read line {} in {}", i + 1, file.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let rec: Record = serde_json::from_str(&line)
                .with_context(|| format!("parse line {} in {}", i + 1, file.display()))?;
            records.push(rec);
        }
        Ok((schema, records))
    }

    /// Rewrite a record set atomically under its lock marker.
    fn write_record_set(
        &self,
        path: &RecordSetPath,
        schema: &Schema,
        records: &[Record],
    ) -> Result<()> {
        let file = Self::record_set_file(path);
        let _lock = LockMarker::acquire(Self::lock_file(path))?;
        let tmp = file.with_extension(format!("{RECORD_SET_EXT}.tmp"));
        {
            let f = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
            let mut w = BufWriter::new(f);
            serde_json::to_writer(&mut w, schema)
                .with_context(|| format!("serialize header to {}", tmp.display()))?;
            w.write_all(b"\n")?;
            for (i, rec) in records.iter().enumerate() {
                serde_json::to_writer(&mut w, rec)
                    .with_context(|| format!("serialize row #{i} to {}", tmp.display()))?;
                w.write_all(b"\n")?;
            }
            w.flush()?;
        }
        rename(&tmp, &file)
            .with_context(|| format!("rename {} -> {}", tmp.display(), file.display()))?;
        self.invalidate(&file);
        Ok(())
    }

    fn append_rows(&self, path: &RecordSetPath, records: &[Record]) -> Result<()> {
        let file = Self::record_set_file(path);
        let _lock = LockMarker::acquire(Self::lock_file(path))?;
        let f = OpenOptions::new()
            .append(true)
            .open(&file)
            .with_context(|| format!("open {} for append", file.display()))?;
        let mut w = BufWriter::new(f);
        for (i, rec) in records.iter().enumerate() {
            serde_json::to_writer(&mut w, rec)
                .with_context(|| format!("serialize row #{i} to {}", file.display()))?;
            w.write_all(b"\n")?;
        }
        w.flush()?;
        Ok(())
    }

    fn record_set_dirs(&self, container: &Path) -> Result<Vec<PathBuf>> {
        let mut dirs = vec![container.to_path_buf()];
        dirs.extend(
            self.list_groupings(container)?
                .into_iter()
                .map(|g| container.join(g)),
        );
        Ok(dirs)
    }
}

/// Map `source` rows onto `target` field order by name.
fn project(target: &Schema, source: &Schema, rows: Vec<Record>) -> Vec<Record> {
    let mapping: Vec<Option<usize>> = target
        .fields
        .iter()
        .map(|f| source.field_index(&f.name))
        .collect();
    rows.into_iter()
        .map(|rec| Record {
            attributes: mapping
                .iter()
                .map(|m| {
                    m.and_then(|i| rec.attributes.get(i).cloned())
                        .unwrap_or(Value::Null)
                })
                .collect(),
            geometry: rec.geometry,
        })
        .collect()
}

fn check_schema_test(target: &Schema, source: &Schema, source_name: &RecordSetPath) -> Result<()> {
    for field in &target.fields {
        let Some(i) = source.field_index(&field.name) else {
            bail!("schema test failed: {source_name} lacks field {}", field.name);
        };
        ensure!(
            source.fields[i].field_type == field.field_type,
            "schema test failed: field {} of {source_name} has type {:?}, expected {:?}",
            field.name,
            source.fields[i].field_type,
            field.field_type
        );
    }
    Ok(())
}

impl FeatureStore for LocalStore {
    fn create_container(&self, path: &Path) -> Result<()> {
        ensure!(
            !self.container_exists(path),
            "container already exists: {}",
            path.display()
        );
        create_dir_all(path).with_context(|| format!("mkdir -p {}", path.display()))?;
        let marker = ContainerMarker {
            format: "geomerge-local".to_string(),
            version: 1,
        };
        let f = File::create(path.join(CONTAINER_MARKER))
            .with_context(|| format!("create marker in {}", path.display()))?;
        serde_json::to_writer(f, &marker)?;
        debug!(container = %path.display(), "container created");
        Ok(())
    }

    fn container_exists(&self, path: &Path) -> bool {
        path.join(CONTAINER_MARKER).is_file()
    }

    fn create_grouping(
        &self,
        container: &Path,
        name: &str,
        spatial_reference: u32,
    ) -> Result<()> {
        Self::validate_name(name)?;
        ensure!(
            self.container_exists(container),
            "container not found: {}",
            container.display()
        );
        ensure!(
            !self.grouping_exists(container, name),
            "grouping {name} already exists in {}",
            container.display()
        );
        let dir = container.join(name);
        create_dir_all(&dir).with_context(|| format!("mkdir -p {}", dir.display()))?;
        let f = File::create(dir.join(GROUPING_MARKER))
            .with_context(|| format!("create marker in {}", dir.display()))?;
        serde_json::to_writer(f, &GroupingMarker { spatial_reference })?;
        Ok(())
    }

    fn grouping_exists(&self, container: &Path, name: &str) -> bool {
        container.join(name).join(GROUPING_MARKER).is_file()
    }

    fn list_groupings(&self, container: &Path) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in
            read_dir(container).with_context(|| format!("read dir {}", container.display()))?
        {
            let entry = entry?;
            if entry.path().join(GROUPING_MARKER).is_file()
                && let Some(name) = entry.file_name().to_str()
            {
                out.push(name.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    fn import_file(&self, source: &Path, target: &RecordSetPath) -> Result<u64> {
        self.check_new(target)?;
        let mut data = read_shapefile(source)?;
        data.schema.spatial_reference = self.grouping_spatial_reference(target);
        self.write_record_set(target, &data.schema, &data.records)?;
        Ok(data.records.len() as u64)
    }

    fn import_table(&self, source: &Path, target: &RecordSetPath) -> Result<u64> {
        self.check_new(target)?;
        let data = read_dbf(source)?;
        self.write_record_set(target, &data.schema, &data.records)?;
        Ok(data.records.len() as u64)
    }

    fn record_set_exists(&self, path: &RecordSetPath) -> bool {
        Self::record_set_file(path).is_file()
    }

    fn list_record_sets(&self, container: &Path, grouping: Option<&str>) -> Result<Vec<String>> {
        let dir = Self::grouping_dir(container, grouping);
        let mut out = Vec::new();
        for entry in read_dir(&dir).with_context(|| format!("read dir {}", dir.display()))? {
            let path = entry?.path();
            if path.is_file()
                && path
                    .extension()
                    .is_some_and(|e| e.eq_ignore_ascii_case(RECORD_SET_EXT))
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                out.push(stem.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    fn describe_geometry(&self, path: &RecordSetPath) -> Result<GeometryKind> {
        Ok(self.read_schema(path)?.geometry)
    }

    fn list_fields(&self, path: &RecordSetPath) -> Result<Vec<FieldDef>> {
        Ok(self.read_schema(path)?.fields)
    }

    fn count_rows(&self, path: &RecordSetPath) -> Result<u64> {
        let file = Self::record_set_file(path);
        let f = File::open(&file).with_context(|| format!("open {}", file.display()))?;
        let mut n = 0u64;
        for line in BufReader::new(f).lines().skip(1) {
            if !line?.trim().is_empty() {
                n += 1;
            }
        }
        Ok(n)
    }

    fn add_field(&self, path: &RecordSetPath, field: &FieldDef) -> Result<()> {
        let (mut schema, mut records) = self.read_record_set(path)?;
        ensure!(
            !schema.has_field(&field.name),
            "field {} already exists in {path}",
            field.name
        );
        schema.fields.push(field.clone());
        for rec in &mut records {
            rec.attributes.push(Value::Null);
        }
        self.write_record_set(path, &schema, &records)
    }

    fn delete_field(&self, path: &RecordSetPath, name: &str) -> Result<()> {
        let (mut schema, mut records) = self.read_record_set(path)?;
        let idx = schema
            .field_index(name)
            .ok_or_else(|| anyhow!("field {name} not found in {path}"))?;
        schema.fields.remove(idx);
        for rec in &mut records {
            if idx < rec.attributes.len() {
                rec.attributes.remove(idx);
            }
        }
        self.write_record_set(path, &schema, &records)
    }

    fn create_record_set(
        &self,
        path: &RecordSetPath,
        template: &RecordSetPath,
        spatial_reference: u32,
    ) -> Result<()> {
        self.check_new(path)?;
        let mut schema = self
            .read_schema(template)
            .with_context(|| format!("read template {template}"))?;
        schema.spatial_reference = Some(spatial_reference);
        self.write_record_set(path, &schema, &[])
    }

    fn delete_record_set(&self, path: &RecordSetPath) -> Result<()> {
        let file = Self::record_set_file(path);
        remove_file(&file).with_context(|| format!("remove {}", file.display()))?;
        self.invalidate(&file);
        Ok(())
    }

    fn update_rows(
        &self,
        path: &RecordSetPath,
        fields: &[&str],
        visit: &mut RowVisitor<'_>,
    ) -> Result<u64> {
        let (schema, mut records) = self.read_record_set(path)?;
        let accessor = RowAccessor::bind(&schema, fields).with_context(|| format!("{path}"))?;
        let mut updated = 0u64;
        for rec in &mut records {
            let mut row = CursorRow::new(&accessor, rec);
            if visit(&mut row)? {
                updated += 1;
            }
        }
        if updated > 0 {
            self.write_record_set(path, &schema, &records)?;
        }
        Ok(updated)
    }

    fn append(
        &self,
        sources: &[RecordSetPath],
        target: &RecordSetPath,
        policy: SchemaPolicy,
    ) -> Result<u64> {
        let target_schema = self.read_schema(target)?;
        let mut rows = Vec::new();
        for source in sources {
            let (schema, records) = self.read_record_set(source)?;
            ensure!(
                schema.geometry == target_schema.geometry,
                "geometry mismatch appending {source} ({}) into {target} ({})",
                schema.geometry,
                target_schema.geometry
            );
            if policy == SchemaPolicy::Test {
                check_schema_test(&target_schema, &schema, source)?;
            }
            rows.extend(project(&target_schema, &schema, records));
        }
        self.append_rows(target, &rows)?;
        Ok(rows.len() as u64)
    }

    fn merge(&self, sources: &[RecordSetPath], target: &RecordSetPath) -> Result<u64> {
        ensure!(!sources.is_empty(), "merge into {target} without sources");
        self.check_new(target)?;
        let mut loaded = Vec::with_capacity(sources.len());
        for source in sources {
            loaded.push(self.read_record_set(source)?);
        }

        let first = &loaded[0].0;
        let mut merged = Schema {
            geometry: first.geometry,
            spatial_reference: first.spatial_reference,
            fields: Vec::new(),
        };
        for ((schema, _), source) in loaded.iter().zip(sources) {
            ensure!(
                schema.geometry == merged.geometry,
                "geometry mismatch merging {source} ({}) into {target} ({})",
                schema.geometry,
                merged.geometry
            );
            for f in &schema.fields {
                if !merged.has_field(&f.name) {
                    merged.fields.push(f.clone());
                }
            }
        }

        let mut rows = Vec::new();
        for (schema, records) in loaded {
            rows.extend(project(&merged, &schema, records));
        }
        self.write_record_set(target, &merged, &rows)?;
        Ok(rows.len() as u64)
    }

    fn copy_record_set(&self, source: &RecordSetPath, target: &RecordSetPath) -> Result<u64> {
        self.check_new(target)?;
        let from = Self::record_set_file(source);
        let to = Self::record_set_file(target);
        {
            let _lock = LockMarker::acquire(Self::lock_file(target))?;
            std::fs::copy(&from, &to)
                .with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
        }
        self.invalidate(&to);
        self.count_rows(target)
    }

    fn compact(&self, container: &Path) -> Result<()> {
        for dir in self.record_set_dirs(container)? {
            for entry in read_dir(&dir).with_context(|| format!("read dir {}", dir.display()))? {
                let path = entry?.path();
                if path
                    .extension()
                    .is_some_and(|e| e.eq_ignore_ascii_case(LOCK_EXT))
                {
                    debug!(lock = %path.display(), "removing stale lock marker");
                    remove_file(&path).ok();
                }
            }
        }
        for dir in self.record_set_dirs(container)? {
            let grouping = if dir == container {
                None
            } else {
                dir.file_name().and_then(|n| n.to_str()).map(str::to_string)
            };
            for name in self.list_record_sets(container, grouping.as_deref())? {
                let rs = RecordSetPath::new(container, grouping.as_deref(), &name);
                let (schema, records) = self.read_record_set(&rs)?;
                self.write_record_set(&rs, &schema, &records)?;
            }
        }
        Ok(())
    }

    fn clear_workspace_cache(&self) {
        self.schema_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
