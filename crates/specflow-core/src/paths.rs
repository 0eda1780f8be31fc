use crate::error::{Result, SpecflowError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const SPECIFY_DIR: &str = ".specify";
pub const STATE_FILE: &str = ".specify/orchestration-state.json";
pub const CONFIG_FILE: &str = ".specify/specflow.yaml";

pub const SPEC_MD: &str = "spec.md";
pub const PLAN_MD: &str = "plan.md";
pub const TASKS_MD: &str = "tasks.md";

pub const CONSTITUTION_MD: &str = "constitution.md";
pub const DISCOVERY_FILES: &[&str] = &["context.md", "state.md", "decisions.md"];

pub fn state_path(root: &Path) -> PathBuf {
    root.join(STATE_FILE)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn specify_dir(root: &Path) -> PathBuf {
    root.join(SPECIFY_DIR)
}

// ---------------------------------------------------------------------------
// PathSettings: the `config` section of the state document
// ---------------------------------------------------------------------------

/// Project-relative locations of the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSettings {
    #[serde(default = "default_roadmap")]
    pub roadmap: String,
    #[serde(default = "default_specs_root")]
    pub specs_root: String,
    #[serde(default = "default_memory_root")]
    pub memory_root: String,
    #[serde(default = "default_discovery_root")]
    pub discovery_root: String,
    #[serde(default = "default_phases_dir")]
    pub phases_dir: String,
    #[serde(default = "default_history")]
    pub history: String,
}

fn default_roadmap() -> String {
    "ROADMAP.md".to_string()
}

fn default_specs_root() -> String {
    "specs".to_string()
}

fn default_memory_root() -> String {
    ".specify/memory".to_string()
}

fn default_discovery_root() -> String {
    ".specify/discovery".to_string()
}

fn default_phases_dir() -> String {
    ".specify/phases".to_string()
}

fn default_history() -> String {
    ".specify/history/HISTORY.md".to_string()
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            roadmap: default_roadmap(),
            specs_root: default_specs_root(),
            memory_root: default_memory_root(),
            discovery_root: default_discovery_root(),
            phases_dir: default_phases_dir(),
            history: default_history(),
        }
    }
}

impl PathSettings {
    pub fn roadmap_path(&self, root: &Path) -> PathBuf {
        root.join(&self.roadmap)
    }

    pub fn specs_root(&self, root: &Path) -> PathBuf {
        root.join(&self.specs_root)
    }

    pub fn memory_root(&self, root: &Path) -> PathBuf {
        root.join(&self.memory_root)
    }

    pub fn discovery_root(&self, root: &Path) -> PathBuf {
        root.join(&self.discovery_root)
    }

    pub fn phases_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.phases_dir)
    }

    pub fn history_path(&self, root: &Path) -> PathBuf {
        root.join(&self.history)
    }

    pub fn constitution_path(&self, root: &Path) -> PathBuf {
        self.memory_root(root).join(CONSTITUTION_MD)
    }

    /// Locate `specs/<number>` or `specs/<number>-<slug>` for a phase.
    pub fn phase_dir(&self, root: &Path, number: &str) -> Option<PathBuf> {
        find_numbered_entry(&self.specs_root(root), number, |p| p.is_dir())
    }
}

/// Find the first entry in `dir` whose name is `number`, or starts with
/// `number-` / `number.`. Entries are visited in sorted order so the result is
/// deterministic.
fn find_numbered_entry(dir: &Path, number: &str, accept: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();
    paths.into_iter().find(|p| {
        let Some(name) = p.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let matches_number = name == number
            || name
                .strip_prefix(number)
                .is_some_and(|rest| rest.starts_with('-') || rest.starts_with('.'));
        matches_number && accept(p)
    })
}

// ---------------------------------------------------------------------------
// Phase number validation
// ---------------------------------------------------------------------------

static PHASE_NUMBER_RE: OnceLock<Regex> = OnceLock::new();

fn phase_number_re() -> &'static Regex {
    PHASE_NUMBER_RE.get_or_init(|| Regex::new(r"^\d{3,4}$").expect("static regex"))
}

/// Accepts a stored phase identifier: exactly 3 (legacy) or 4 digits.
pub fn validate_phase_number(number: &str) -> Result<()> {
    if !phase_number_re().is_match(number) {
        return Err(SpecflowError::InvalidPhaseNumber(number.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
