use super::open_store;
use crate::output::{or_dash, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use serde_json::Value;
use specflow_core::types::StepName;
use std::path::Path;

#[derive(Subcommand)]
pub enum StateSubcommand {
    /// Show the active phase, step statuses and interview progress
    Show,

    /// Print the value at a dotted key path (e.g. orchestration.branch)
    Get { key: String },

    /// Set the value at a dotted key path. The value is parsed as JSON,
    /// falling back to a plain string.
    Set { key: String, value: String },

    /// Return a step to pending (the only way out of failed or completed)
    ResetStep { step: String },
}

pub fn run(root: &Path, subcmd: StateSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        StateSubcommand::Show => show(root, json),
        StateSubcommand::Get { key } => get(root, &key, json),
        StateSubcommand::Set { key, value } => set(root, &key, &value, json),
        StateSubcommand::ResetStep { step } => reset_step(root, &step, json),
    }
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let state = store.state();

    if json {
        let value = serde_json::json!({
            "state": state,
            "next_step": state.next_step(),
            "task_tally": state.task_tally(),
            "notices": store.notices(),
        });
        return print_json(&value);
    }

    let orch = &state.orchestration;
    println!("Schema:    {}", state.schema_version);
    println!("Phase:     {}", or_dash(state.active_phase()));
    if let Some(name) = &orch.phase_name {
        println!("Name:      {name}");
    }
    println!("Branch:    {}", or_dash(orch.branch.as_deref()));
    println!("Status:    {}", orch.status);
    println!(
        "Interview: {} (phase {}, {} decisions)",
        state.interview.status, state.interview.current_phase, state.interview.decisions_count
    );
    if let Some(tally) = state.task_tally() {
        println!("Tasks:     {tally}");
    }
    if let Some(next) = state.next_step() {
        println!("Next step: {next}");
    }
    println!("Updated:   {}", state.last_updated.to_rfc3339());

    if !orch.steps.is_empty() {
        println!();
        let rows = orch
            .steps
            .iter()
            .map(|(name, step)| {
                vec![
                    name.to_string(),
                    step.status.to_string(),
                    step.completed_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                    step.artifacts.join(", "),
                ]
            })
            .collect();
        print_table(&["STEP", "STATUS", "COMPLETED", "ARTIFACTS"], rows);
    }

    for notice in store.notices() {
        println!("warning: {notice}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// get / set
// ---------------------------------------------------------------------------

fn get(root: &Path, key: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let value = store
        .get(key)?
        .with_context(|| format!("key not found: {key}"))?;
    if json {
        return print_json(&serde_json::json!({ "key": key, "value": value }));
    }
    match value {
        Value::String(s) => println!("{s}"),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

fn set(root: &Path, key: &str, raw: &str, json: bool) -> anyhow::Result<()> {
    let mut store = open_store(root)?;
    let value: Value =
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    store
        .set(key, value.clone())
        .with_context(|| format!("failed to set {key}"))?;
    if json {
        return print_json(&serde_json::json!({ "key": key, "value": value }));
    }
    println!("Set {key} = {}", serde_json::to_string(&value)?);
    Ok(())
}

fn reset_step(root: &Path, step: &str, json: bool) -> anyhow::Result<()> {
    let step: StepName = step.parse()?;
    let mut store = open_store(root)?;
    let previous = store.state().step_status(step);
    store.reset_step(step)?;
    if json {
        return print_json(&serde_json::json!({
            "step": step,
            "previous": previous,
            "status": store.state().step_status(step),
        }));
    }
    println!("Reset {step}: {previous} -> pending");
    Ok(())
}
