use anyhow::Result;
use geomerge::catalog::Category;
use geomerge::planner::{ChunkPlanner, PlanningWarning, UnitId, balance, discover};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

fn write_sized(path: &Path, bytes: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, vec![b'x'; bytes])?;
    Ok(())
}

#[test]
fn balance_uses_largest_first_lowest_index_ties() {
    let bins = balance(vec![100u64, 90, 80, 70, 60, 50, 40, 30, 20, 10], |s| *s, 4);
    assert_eq!(
        bins,
        vec![vec![100, 30, 20], vec![90, 40, 10], vec![80, 50], vec![70, 60]]
    );

    let totals: Vec<u64> = bins.iter().map(|b| b.iter().sum()).collect();
    let max = *totals.iter().max().unwrap_or(&0);
    let mean = totals.iter().sum::<u64>() / totals.len() as u64;
    assert!(max <= mean + 100, "max {max} exceeds mean {mean} + largest item");
}

#[test]
fn balance_keeps_every_item_once() {
    let items: Vec<u64> = (1..=37).map(|i| (i * 7919) % 101).collect();
    let bins = balance(items.clone(), |s| *s, 5);
    assert_eq!(bins.len(), 5);

    let mut seen: Vec<u64> = bins.into_iter().flatten().collect();
    let mut expected = items;
    seen.sort_unstable();
    expected.sort_unstable();
    assert_eq!(seen, expected);
}

#[test]
fn balance_with_fewer_items_than_bins_leaves_empty_bins() {
    let bins = balance(vec![5u64, 3], |s| *s, 4);
    assert_eq!(bins, vec![vec![5], vec![3], vec![], vec![]]);
    assert_eq!(balance(Vec::<u64>::new(), |s| *s, 0).len(), 1);
}

#[test]
fn discovery_is_recursive_and_case_insensitive() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dir = tmp.path().join("Urbano");
    write_sized(&dir.join("35001/35001_PARCELA.shp"), 10)?;
    write_sized(&dir.join("35001/35001_PARCELA.dbf"), 10)?;
    write_sized(&dir.join("35002/deep/35002_MASA.SHP"), 20)?;
    write_sized(&dir.join("notes.txt"), 5)?;

    let files = discover(&dir, Category::Urbano, "shp")?;
    let names: Vec<_> = files
        .iter()
        .map(|f| f.path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    assert_eq!(
        names,
        vec![
            Some("35001_PARCELA.shp".to_string()),
            Some("35002_MASA.SHP".to_string())
        ]
    );
    assert_eq!(files[0].size, 10);
    assert_eq!(files[0].partition_key, Some(35001));
    assert_eq!(files[1].category, Category::Urbano);
    Ok(())
}

#[test]
fn plan_is_complete_with_offset_unit_ids() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let rustico = tmp.path().join("Rústico");
    let urbano = tmp.path().join("Urbano");
    let mut written = BTreeSet::new();
    for (i, size) in [400, 300, 200, 100, 50].into_iter().enumerate() {
        let path = rustico.join(format!("3500{i}/3500{i}_PARCELA.shp"));
        write_sized(&path, size)?;
        written.insert(path);
    }
    for (i, size) in [70, 60].into_iter().enumerate() {
        let path = urbano.join(format!("3810{i}/3810{i}_MASA.shp"));
        write_sized(&path, size)?;
        written.insert(path);
    }

    let chunk_dir = tmp.path().join("chunks");
    let planner = ChunkPlanner::new(3, "shp", &chunk_dir);
    let plan = planner.plan(&[
        (Category::Rustico, rustico.clone()),
        (Category::Urbano, urbano.clone()),
    ])?;

    assert!(plan.warnings.is_empty());
    assert_eq!(plan.file_count(), written.len());
    let planned: BTreeSet<PathBuf> = plan
        .units
        .iter()
        .flat_map(|u| u.files.iter().map(|f| f.path.clone()))
        .collect();
    assert_eq!(planned, written);

    let ids: Vec<String> = plan.units.iter().map(|u| u.id.to_string()).collect();
    // the empty third Urbano bin is dropped
    assert_eq!(ids, vec!["R0", "R1", "R2", "U3", "U4"]);
    assert_eq!(plan.units[0].total_bytes(), 400);
    // 50 ties between R1 and R2 at 300 and goes to the lower index
    assert_eq!(plan.units[1].total_bytes(), 350);
    assert_eq!(plan.units[2].total_bytes(), 300);
    assert_eq!(plan.units[3].container, chunk_dir.join("chunk_U3"));
    assert!(
        plan.units
            .iter()
            .all(|u| u.files.iter().all(|f| f.category == u.id.category))
    );
    Ok(())
}

#[test]
fn missing_directory_is_a_warning() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let urbano = tmp.path().join("Urbano");
    write_sized(&urbano.join("38001/38001_EJES.shp"), 10)?;
    let missing = tmp.path().join("Rústico");

    let plan = ChunkPlanner::new(2, "shp", tmp.path().join("chunks")).plan(&[
        (Category::Rustico, missing.clone()),
        (Category::Urbano, urbano),
    ])?;

    assert_eq!(
        plan.warnings,
        vec![PlanningWarning::MissingInputDir {
            category: Category::Rustico,
            path: missing,
        }]
    );
    assert_eq!(plan.units.len(), 1);
    assert_eq!(
        plan.units[0].id,
        UnitId {
            category: Category::Urbano,
            index: 2
        }
    );
    Ok(())
}

#[test]
fn planning_is_deterministic() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dir = tmp.path().join("Urbano");
    for i in 0..12 {
        write_sized(&dir.join(format!("380{i:02}/380{i:02}_CONSTRU.shp")), 10 + (i % 4) * 5)?;
    }
    let planner = ChunkPlanner::new(4, "shp", tmp.path().join("chunks"));
    let inputs = [(Category::Urbano, dir)];

    let first: Vec<Vec<PathBuf>> = planner
        .plan(&inputs)?
        .units
        .into_iter()
        .map(|u| u.files.into_iter().map(|f| f.path).collect())
        .collect();
    let second: Vec<Vec<PathBuf>> = planner
        .plan(&inputs)?
        .units
        .into_iter()
        .map(|u| u.files.into_iter().map(|f| f.path).collect())
        .collect();
    assert_eq!(first, second);
    Ok(())
}
