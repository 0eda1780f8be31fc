use crate::output::print_json;
use anyhow::Context;
use serde::Serialize;
use specflow_core::{config::Config, io, paths, state::StateStore, SpecflowError};
use std::path::Path;

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum Outcome {
    Created,
    Exists,
    Reinitialized,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Created => "created:",
            Outcome::Exists => "exists: ",
            Outcome::Reinitialized => "reset:  ",
        }
    }
}

#[derive(Serialize)]
struct InitReport {
    root: String,
    state: Outcome,
    config: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    backup: Option<String>,
}

pub fn run(root: &Path, force: bool, json: bool) -> anyhow::Result<()> {
    let specify = paths::specify_dir(root);
    io::ensure_dir(&specify).with_context(|| format!("failed to create {}", specify.display()))?;

    let state_path = paths::state_path(root);
    let had_document = state_path.exists();
    let (state, backup) = if force {
        StateStore::reinitialize(root).context("failed to reinitialize state")?;
        let backup = had_document.then(|| format!("{}.bak", paths::STATE_FILE));
        let outcome = if had_document {
            Outcome::Reinitialized
        } else {
            Outcome::Created
        };
        (outcome, backup)
    } else {
        match StateStore::create(root) {
            Ok(_) => (Outcome::Created, None),
            Err(SpecflowError::AlreadyInitialized(_)) => {
                // An existing document must at least load; a broken one needs --force.
                StateStore::open(root).context(
                    "existing state document is unreadable; rerun with --force to back it up and start over",
                )?;
                (Outcome::Exists, None)
            }
            Err(e) => return Err(e).context("failed to write state document"),
        }
    };

    let config_path = paths::config_path(root);
    let config = if config_path.exists() {
        Outcome::Exists
    } else {
        Config::default()
            .save(root)
            .context("failed to write specflow.yaml")?;
        Outcome::Created
    };

    let report = InitReport {
        root: root.display().to_string(),
        state,
        config,
        backup,
    };

    if json {
        return print_json(&report);
    }
    println!("Initializing specflow in: {}", report.root);
    println!("  {} {}", report.state.label(), paths::STATE_FILE);
    if let Some(backup) = &report.backup {
        println!("  backup:  {backup}");
    }
    println!("  {} {}", report.config.label(), paths::CONFIG_FILE);
    Ok(())
}
