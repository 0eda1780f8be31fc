use super::{open_store, CommandFailure};
use crate::output::{or_dash, print_json};
use specflow_core::{
    reconcile::{Difference, Reconciler},
    types::TrustMode,
    vcs::Git,
};
use std::path::Path;

pub fn run(
    root: &Path,
    dry_run: bool,
    trust_files: bool,
    trust_state: bool,
    json: bool,
) -> anyhow::Result<()> {
    let mut store = open_store(root)?;
    let git = Git::new(root);
    let reconciler = Reconciler::new(root, &git);

    let trust = match (trust_files, trust_state) {
        (true, _) => Some(TrustMode::Files),
        (_, true) => Some(TrustMode::State),
        _ => None,
    };

    // Without a trust mode this is a plain read-only diff.
    let Some(trust) = trust else {
        let differences = reconciler.diff(store.state());
        if json {
            print_json(&serde_json::json!({
                "trust": null,
                "dry_run": dry_run,
                "in_sync": differences.is_empty(),
                "applied": [],
                "reported": &differences,
            }))?;
        } else if differences.is_empty() {
            println!("In sync.");
        } else {
            print_differences(&differences);
            println!();
            println!("Run with --trust-files to repair what the files can prove.");
        }
        return finish(differences.len());
    };

    let outcome = reconciler.reconcile(&mut store, trust, dry_run)?;
    if json {
        let mut value = serde_json::to_value(&outcome)?;
        value["in_sync"] = serde_json::Value::Bool(outcome.in_sync());
        print_json(&value)?;
    } else {
        if !outcome.applied.is_empty() {
            let verb = if dry_run { "Would apply" } else { "Applied" };
            println!("{verb} {} fix(es) (trust: {trust}):", outcome.applied.len());
            for fix in &outcome.applied {
                println!(
                    "  {:<16} {} -> {}",
                    fix.area.to_string(),
                    or_dash(fix.from.as_deref()),
                    fix.to
                );
            }
        }
        if !outcome.reported.is_empty() {
            if !outcome.applied.is_empty() {
                println!();
            }
            print_differences(&outcome.reported);
        }
        if outcome.in_sync() {
            println!("In sync.");
        }
    }

    if outcome.in_sync() {
        return Ok(());
    }
    let unresolved = if dry_run {
        outcome.reported.len() + outcome.applied.len()
    } else {
        outcome.reported.len()
    };
    finish(unresolved)
}

fn finish(unresolved: usize) -> anyhow::Result<()> {
    if unresolved > 0 {
        return Err(CommandFailure::new(
            2,
            format!("drift: {unresolved} unresolved difference(s)"),
        ));
    }
    Ok(())
}

fn print_differences(differences: &[Difference]) {
    println!("{} difference(s):", differences.len());
    for d in differences {
        let repair = if d.repairable { "repairable" } else { "manual" };
        println!("  [{}] {} ({repair})", d.area, d.description);
        println!(
            "      recorded: {}  observed: {}",
            or_dash(d.recorded.as_deref()),
            or_dash(d.observed.as_deref())
        );
    }
}
