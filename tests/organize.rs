use anyhow::Result;
use geomerge::ingest::organize::file_prefix;
use geomerge::ingest::FileOrganizer;
use std::fs;
use std::path::Path;

fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, b"x")?;
    Ok(())
}

#[test]
fn prefix_is_first_seven_characters() {
    assert_eq!(file_prefix(Path::new("out/Urbano/35001UA")).as_deref(), Some("35001UA_"));
    assert_eq!(file_prefix(Path::new("out/Urbano/35001UA_extra")).as_deref(), Some("35001UA_"));
    assert_eq!(file_prefix(Path::new("out/Urbano/350")).as_deref(), Some("350_"));
}

#[test]
fn sorts_folders_into_categories() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let base = tmp.path();
    touch(&base.join("35_UA_2024/35001UA/PARCELA.shp"))?;
    touch(&base.join("35_UA_2024/35001UA/PARCELA.dbf"))?;
    touch(&base.join("35_UA_2024/35001UA/raw.zip"))?;
    touch(&base.join("35_RA_2024/35002RA/MASA.shp"))?;
    // classified folders are found below unclassified ones
    touch(&base.join("batch/38_UA_2024/38001UA/EJES.shp"))?;
    touch(&base.join("misc/readme.txt"))?;

    let report = FileOrganizer::new().organize(base)?;

    assert!(base.join("Urbano/35001UA/35001UA_PARCELA.shp").is_file());
    assert!(base.join("Urbano/35001UA/35001UA_PARCELA.dbf").is_file());
    assert!(base.join("Urbano/35001UA/raw.zip").is_file());
    assert!(base.join("Rústico/35002RA/35002RA_MASA.shp").is_file());
    assert!(base.join("Urbano/38001UA/38001UA_EJES.shp").is_file());
    assert_eq!(report.moved.len(), 3);
    assert_eq!(report.renamed, 4);

    for leftover in ["35_UA_2024", "35_RA_2024", "batch", "misc"] {
        assert!(!base.join(leftover).exists(), "{leftover} not removed");
    }
    assert_eq!(report.removed.len(), 4);
    Ok(())
}

#[test]
fn existing_destination_is_merged_without_reprefixing() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let base = tmp.path();
    touch(&base.join("35_UA_2024/35001UA/PARCELA.shp"))?;
    FileOrganizer::new().organize(base)?;

    touch(&base.join("35_UA_2025/35001UA/CONSTRU.shp"))?;
    touch(&base.join("35_UA_2025/35001UA/35001UA_MASA.shp"))?;
    let report = FileOrganizer::new().organize(base)?;

    let dir = base.join("Urbano/35001UA");
    let mut names: Vec<String> = fs::read_dir(&dir)?
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["35001UA_CONSTRU.shp", "35001UA_MASA.shp", "35001UA_PARCELA.shp"]
    );
    assert_eq!(report.merged, vec![dir]);
    assert_eq!(report.renamed, 1);
    assert!(report.moved.is_empty());
    Ok(())
}

#[test]
fn rerun_leaves_organized_tree_alone() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let base = tmp.path();
    touch(&base.join("35_RA_2024/35002RA/MASA.shp"))?;
    FileOrganizer::new().organize(base)?;

    let report = FileOrganizer::new().organize(base)?;
    assert!(report.moved.is_empty());
    assert_eq!(report.renamed, 0);
    assert!(base.join("Rústico/35002RA/35002RA_MASA.shp").is_file());
    Ok(())
}
