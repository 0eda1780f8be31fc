use super::open_store;
use crate::output::{display_path, or_dash, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use serde::Serialize;
use specflow_core::{
    gate::resolve_phase_dir,
    migrate::{archive_phase, normalize_fuzzy},
    paths,
    roadmap::{self, PhaseRecord, Roadmap},
    types::{PhaseFormat, StepName},
    vcs::{Git, VcsSnapshot, VersionControl},
    SpecflowError,
};
use std::path::Path;

#[derive(Subcommand)]
pub enum PhaseSubcommand {
    /// Make a phase active with every step pending
    Start {
        /// Phase number; short forms like `1` or `42` are resolved against the roadmap
        number: String,
        /// Phase name (default: from the roadmap)
        #[arg(long)]
        name: Option<String>,
        /// Branch to record (default: the current git branch)
        #[arg(long)]
        branch: Option<String>,
    },

    /// Show the active phase and every roadmap phase
    Status,

    /// Resolve a short or legacy phase number
    Lookup { input: String },

    /// Move a completed phase into the history document
    Archive { number: String },
}

pub fn run(root: &Path, subcmd: PhaseSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        PhaseSubcommand::Start {
            number,
            name,
            branch,
        } => start(root, &number, name, branch, json),
        PhaseSubcommand::Status => status(root, json),
        PhaseSubcommand::Lookup { input } => lookup(root, &input, json),
        PhaseSubcommand::Archive { number } => archive(root, &number, json),
    }
}

/// Fuzzy-resolve `input` against known phases; a well-formed number that is
/// not on the roadmap yet is accepted as typed.
fn resolve_number(root: &Path, settings: &paths::PathSettings, input: &str) -> anyhow::Result<String> {
    let known = roadmap::known_numbers(root, settings);
    if let Some(number) = normalize_fuzzy(input, &known)? {
        return Ok(number);
    }
    if paths::validate_phase_number(input).is_ok() {
        tracing::warn!(phase = input, "phase is not listed in the roadmap");
        return Ok(input.to_string());
    }
    Err(SpecflowError::PhaseNotFound(input.to_string()).into())
}

// ---------------------------------------------------------------------------
// start
// ---------------------------------------------------------------------------

fn start(
    root: &Path,
    input: &str,
    name: Option<String>,
    branch: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let mut store = open_store(root)?;
    let settings = store.state().config.clone();
    let number = resolve_number(root, &settings, input)?;
    let name = name.or_else(|| roadmap::lookup(root, &settings, &number).map(|p| p.name));
    let branch = branch.or_else(|| Git::new(root).current_branch());

    store
        .start_phase(&number, name.as_deref(), branch.as_deref())
        .with_context(|| format!("failed to start phase {number}"))?;

    if json {
        return print_json(&serde_json::json!({
            "phase_number": number,
            "phase_name": name,
            "branch": branch,
            "steps": store.state().orchestration.steps,
        }));
    }
    println!("Started phase {number}{}", name.map(|n| format!(" ({n})")).unwrap_or_default());
    println!("  branch: {}", or_dash(branch.as_deref()));
    Ok(())
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PhaseStatusReport {
    active: Option<String>,
    record: Option<PhaseRecord>,
    phase_dir: Option<String>,
    next_step: Option<StepName>,
    vcs: VcsSnapshot,
    roadmap_format: PhaseFormat,
    phases: Vec<PhaseRecord>,
}

fn status(root: &Path, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let state = store.state();
    let settings = &state.config;
    let roadmap = Roadmap::load(&settings.roadmap_path(root));
    let active = state.active_phase().map(str::to_string);

    let report = PhaseStatusReport {
        record: active
            .as_deref()
            .and_then(|n| roadmap::lookup(root, settings, n)),
        phase_dir: active
            .as_deref()
            .map(|n| display_path(root, &resolve_phase_dir(root, settings, n))),
        active,
        next_step: state.next_step(),
        vcs: VcsSnapshot::capture(&Git::new(root)),
        roadmap_format: roadmap.format(),
        phases: roadmap.rows(),
    };

    if json {
        return print_json(&report);
    }

    match &report.active {
        Some(number) => {
            let name = report.record.as_ref().map(|r| r.name.as_str());
            println!("Active phase: {number} {}", name.unwrap_or(""));
            println!("  directory:  {}", or_dash(report.phase_dir.as_deref()));
            if let Some(record) = &report.record {
                println!("  roadmap:    {}", record.status);
            }
            if let Some(next) = report.next_step {
                println!("  next step:  {next}");
            }
        }
        None => println!("No active phase."),
    }
    let vcs = &report.vcs;
    println!(
        "Branch: {}{}",
        or_dash(vcs.branch.as_deref()),
        if vcs.uncommitted_changes { " (uncommitted changes)" } else { "" }
    );
    if let (Some(ahead), Some(behind)) = (vcs.ahead, vcs.behind) {
        println!("  ahead {ahead}, behind {behind}");
    }

    println!();
    println!("Roadmap format: {}", report.roadmap_format);
    if report.phases.is_empty() {
        println!("No phases in roadmap.");
        return Ok(());
    }
    let rows = report
        .phases
        .iter()
        .map(|p| {
            let marker = if report.active.as_deref() == Some(p.number.as_str()) { "*" } else { "" };
            vec![marker.to_string(), p.number.clone(), p.name.clone(), p.status.to_string()]
        })
        .collect();
    print_table(&["", "PHASE", "NAME", "STATUS"], rows);
    Ok(())
}

// ---------------------------------------------------------------------------
// lookup / archive
// ---------------------------------------------------------------------------

fn lookup(root: &Path, input: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let settings = &store.state().config;
    let known = roadmap::known_numbers(root, settings);
    let number = normalize_fuzzy(input, &known)?
        .ok_or_else(|| SpecflowError::PhaseNotFound(input.to_string()))?;
    let record = roadmap::lookup(root, settings, &number);

    if json {
        return print_json(&serde_json::json!({
            "input": input,
            "number": number,
            "record": record,
        }));
    }
    match record {
        Some(r) => println!("{number}  {}  [{}]", r.name, r.status),
        None => println!("{number}"),
    }
    Ok(())
}

fn archive(root: &Path, input: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let settings = store.state().config.clone();
    let known = roadmap::known_numbers(root, &settings);
    let number = normalize_fuzzy(input, &known)?
        .ok_or_else(|| SpecflowError::PhaseNotFound(input.to_string()))?;
    let report = archive_phase(root, &settings, &number)
        .with_context(|| format!("failed to archive phase {number}"))?;

    if json {
        return print_json(&report);
    }
    println!(
        "Archived phase {} ({}) to {}",
        report.number,
        report.name,
        display_path(root, &report.history)
    );
    if let Some(file) = &report.removed_file {
        println!("  removed: {}", display_path(root, file));
    }
    if report.removed_inline_section {
        println!("  removed inline roadmap section");
    }
    Ok(())
}
