#![cfg(feature = "zip-extract")]

use anyhow::Result;
use geomerge::ingest::ArchiveExtractor;
use geomerge::ingest::extract::extract_nested;
use std::fs::{self, File};
use std::io::{Cursor, Write};
use std::path::Path;
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

fn zip_bytes(entries: &[(&str, &[u8])]) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, data) in entries {
        writer.start_file(*name, options)?;
        writer.write_all(data)?;
    }
    Ok(writer.finish()?.into_inner())
}

fn write_zip(path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path)?.write_all(&zip_bytes(entries)?)?;
    Ok(())
}

#[test]
fn unpacks_outer_nested_and_inner_archives() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let input = tmp.path().join("downloads");
    let output = tmp.path().join("work");

    let deepest = zip_bytes(&[("35001_ELEMTEX.shp", &b"shp"[..])])?;
    let nested = zip_bytes(&[
        ("35001UA/35001_PARCELA.shp", &b"shp"[..]),
        ("35001UA/35001_PARCELA.dbf", &b"dbf"[..]),
        ("35001UA/extra.zip", deepest.as_slice()),
    ])?;
    write_zip(&input.join("35_UA_2024.zip"), &[("35_UA_2024_inner.zip", nested.as_slice())])?;

    let report = ArchiveExtractor::new().with_threads(2).extract_all(&input, &output)?;

    let dir = output.join("35_UA_2024");
    assert_eq!(report.extracted, vec![dir.clone()]);
    assert!(report.failures.is_empty());
    assert!(dir.join("35001UA/35001_PARCELA.shp").is_file());
    assert!(dir.join("35001UA/35001_PARCELA.dbf").is_file());
    assert!(dir.join("35001UA/35001_ELEMTEX.shp").is_file());
    assert!(!dir.join("35001UA/extra.zip").exists());
    assert!(!dir.join("temp_extracted").exists());
    Ok(())
}

#[test]
fn bad_archives_are_reported_and_skipped() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let input = tmp.path().join("downloads");
    let output = tmp.path().join("work");

    let nested = zip_bytes(&[("38001RA/38001_MASA.shp", &b"shp"[..])])?;
    write_zip(&input.join("38_RA_2024.zip"), &[("inner.zip", nested.as_slice())])?;
    fs::write(input.join("corrupt.zip"), b"definitely not a zip")?;
    write_zip(&input.join("split.zip"), &[("part.z01", &b"segment"[..])])?;
    write_zip(&input.join("empty.zip"), &[("readme.txt", &b"nothing here"[..])])?;
    fs::write(input.join("notes.txt"), b"ignored")?;

    let report = ArchiveExtractor::new().extract_all(&input, &output)?;

    assert_eq!(report.extracted, vec![output.join("38_RA_2024")]);
    assert_eq!(report.unsupported, vec![input.join("split.zip")]);
    assert_eq!(report.empty, vec![input.join("empty.zip")]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, input.join("corrupt.zip"));
    assert!(output.join("38_RA_2024/38001RA/38001_MASA.shp").is_file());
    Ok(())
}

#[test]
fn missing_input_directory_is_empty() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let report = ArchiveExtractor::new()
        .extract_all(&tmp.path().join("nowhere"), &tmp.path().join("work"))?;
    assert!(report.extracted.is_empty());
    assert!(report.failures.is_empty());
    Ok(())
}

#[test]
fn nested_sweep_reports_corrupt_archives() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dir = tmp.path().join("35_UA_2024");
    write_zip(&dir.join("a/good.zip"), &[("good.txt", &b"ok"[..])])?;
    fs::create_dir_all(dir.join("b"))?;
    fs::write(dir.join("b/bad.ZIP"), b"garbage")?;

    let failures = extract_nested(&dir)?;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, dir.join("b/bad.ZIP"));
    assert!(dir.join("a/good.txt").is_file());
    assert!(!dir.join("a/good.zip").exists());
    Ok(())
}
