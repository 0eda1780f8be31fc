use super::open_store;
use crate::output::{display_path, print_json};
use anyhow::Context;
use specflow_core::migrate::migrate;
use std::path::Path;

pub fn run(root: &Path, dry_run: bool, json: bool) -> anyhow::Result<()> {
    let mut store = open_store(root)?;
    let report = migrate(&mut store, dry_run).context("phase number migration failed")?;

    if json {
        return print_json(&report);
    }

    if report.is_noop() {
        println!("Nothing to migrate (roadmap format: {}).", report.format_before);
        return Ok(());
    }

    let heading = if dry_run { "Would migrate" } else { "Migrated" };
    println!(
        "{heading} phase numbering: {} -> {}",
        report.format_before, report.format_after
    );
    for r in &report.renumbered {
        println!("  {} -> {}", r.from, r.to);
    }
    if report.roadmap_lines > 0 {
        println!("  roadmap lines rewritten: {}", report.roadmap_lines);
    }
    for rename in &report.renamed {
        println!(
            "  rename {} -> {}",
            display_path(root, &rename.from),
            display_path(root, &rename.to)
        );
    }
    for change in &report.state {
        println!("  state {}: {} -> {}", change.field, change.from, change.to);
    }
    Ok(())
}
