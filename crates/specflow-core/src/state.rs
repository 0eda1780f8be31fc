use crate::error::{Result, SpecflowError};
use crate::inspector::TaskTally;
use crate::migrations::{self, SchemaVersion, CURRENT_SCHEMA_VERSION};
use crate::paths::{self, PathSettings};
use crate::types::{InterviewStatus, OrchestrationStatus, StepName, StepStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level sections every document should carry. Absence is reported, not fatal.
const REQUIRED_SECTIONS: &[&str] = &["config", "interview", "orchestration", "lastUpdated"];

/// Keys owned by the store itself; `set` refuses to write them.
const MANAGED_KEYS: &[&str] = &["schemaVersion", "lastUpdated"];

// ---------------------------------------------------------------------------
// StepState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks_completed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks_total: Option<u32>,
}

impl StepState {
    pub fn tally(&self) -> Option<TaskTally> {
        match (self.tasks_completed, self.tasks_total) {
            (Some(completed), Some(total)) => Some(TaskTally::new(completed, total)),
            _ => None,
        }
    }

    pub fn set_tally(&mut self, tally: TaskTally) {
        self.tasks_completed = Some(tally.completed);
        self.tasks_total = Some(tally.total);
    }
}

// ---------------------------------------------------------------------------
// Interview / Orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interview {
    #[serde(default)]
    pub status: InterviewStatus,
    #[serde(default)]
    pub current_phase: u32,
    #[serde(default)]
    pub decisions_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Orchestration {
    #[serde(default)]
    pub phase_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_name: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub status: OrchestrationStatus,
    #[serde(default, deserialize_with = "known_steps")]
    pub steps: BTreeMap<StepName, StepState>,
}

/// Step keys outside the fixed set are dropped on read, so they are never
/// written back.
fn known_steps<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<StepName, StepState>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    let raw: Option<BTreeMap<String, Value>> = Option::deserialize(deserializer)?;
    let mut steps = BTreeMap::new();
    for (key, value) in raw.unwrap_or_default() {
        match key.parse::<StepName>() {
            Ok(step) => {
                let state: StepState = serde_json::from_value(value)
                    .map_err(|e| D::Error::custom(format!("step '{key}': {e}")))?;
                steps.insert(step, state);
            }
            Err(_) => tracing::warn!(step = %key, "ignoring unknown step in state document"),
        }
    }
    Ok(steps)
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub schema_version: String,
    #[serde(default)]
    pub config: PathSettings,
    #[serde(default)]
    pub interview: Interview,
    #[serde(default)]
    pub orchestration: Orchestration,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    /// Top-level keys this version does not know about, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowState {
    pub fn new() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
            config: PathSettings::default(),
            interview: Interview::default(),
            orchestration: Orchestration::default(),
            last_updated: Utc::now(),
            extra: Map::new(),
        }
    }

    pub fn active_phase(&self) -> Option<&str> {
        self.orchestration.phase_number.as_deref()
    }

    pub fn step(&self, step: StepName) -> Option<&StepState> {
        self.orchestration.steps.get(&step)
    }

    /// Recorded status; a step with no entry reads as `pending`.
    pub fn step_status(&self, step: StepName) -> StepStatus {
        self.step(step).map(|s| s.status).unwrap_or_default()
    }

    /// Task tally of the active phase, kept on the `implement` step.
    pub fn task_tally(&self) -> Option<TaskTally> {
        self.step(StepName::Implement).and_then(StepState::tally)
    }

    /// First step in lifecycle order that is not yet completed.
    pub fn next_step(&self) -> Option<StepName> {
        StepName::all()
            .iter()
            .copied()
            .find(|s| self.step_status(*s) != StepStatus::Completed)
    }

    /// Invariant violations present in the document as loaded.
    pub fn violations(&self) -> Vec<String> {
        self.orchestration
            .steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Completed && s.completed_at.is_none())
            .map(|(name, _)| format!("step '{name}' is completed but has no completedAt"))
            .collect()
    }

    fn normalize(&mut self, now: DateTime<Utc>) {
        for step in self.orchestration.steps.values_mut() {
            if step.status == StepStatus::Completed && step.completed_at.is_none() {
                step.completed_at = Some(now);
            }
            if step.status != StepStatus::Completed {
                step.completed_at = None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Document parsing
// ---------------------------------------------------------------------------

/// Parse and migrate a state document. Returns the typed state plus notices
/// for tolerated problems (missing sections, invariant violations).
pub fn parse_document(text: &str) -> Result<(WorkflowState, Vec<String>)> {
    let value: Value = serde_json::from_str(text).map_err(|e| SpecflowError::Schema {
        reason: format!("malformed JSON: {e}"),
    })?;
    let Value::Object(doc) = value else {
        return Err(SpecflowError::Schema {
            reason: "document is not a JSON object".to_string(),
        });
    };
    let raw_version = doc
        .get("schemaVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| SpecflowError::Schema {
            reason: "missing schemaVersion".to_string(),
        })?;
    let version = SchemaVersion::parse(raw_version).ok_or_else(|| SpecflowError::Schema {
        reason: format!("unrecognized schemaVersion '{raw_version}'"),
    })?;

    let mut notices: Vec<String> = REQUIRED_SECTIONS
        .iter()
        .filter(|key| !doc.contains_key(**key))
        .map(|key| format!("missing section '{key}'; using defaults"))
        .collect();

    let doc = migrations::migrate_state(doc, version)?;
    let state: WorkflowState =
        serde_json::from_value(Value::Object(doc)).map_err(|e| SpecflowError::Schema {
            reason: format!("invalid document: {e}"),
        })?;
    notices.extend(state.violations());
    Ok((state, notices))
}

// ---------------------------------------------------------------------------
// Key paths
// ---------------------------------------------------------------------------

fn split_key_path(key_path: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = key_path.split('.').collect();
    if segments.iter().any(|s| s.trim().is_empty()) {
        return Err(SpecflowError::InvalidKeyPath(key_path.to_string()));
    }
    Ok(segments)
}

fn lookup<'a>(mut value: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    for seg in segments {
        value = value.as_object()?.get(*seg)?;
    }
    Some(value)
}

fn assign(root: &mut Value, segments: &[&str], new_value: Value, key_path: &str) -> Result<()> {
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| SpecflowError::InvalidKeyPath(key_path.to_string()))?;
    let mut cursor = root;
    for seg in parents {
        let obj = cursor
            .as_object_mut()
            .ok_or_else(|| SpecflowError::InvalidKeyPath(key_path.to_string()))?;
        cursor = obj
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if cursor.is_null() {
            *cursor = Value::Object(Map::new());
        }
    }
    cursor
        .as_object_mut()
        .ok_or_else(|| SpecflowError::InvalidKeyPath(key_path.to_string()))?
        .insert(last.to_string(), new_value);
    Ok(())
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Sole owner of the persisted [`WorkflowState`].
///
/// Reads hand out `&WorkflowState`. Every mutation clones the current state,
/// applies the change, validates it and writes it atomically before the new
/// value replaces the old one, so a failed write leaves both the file and the
/// in-memory state untouched.
#[derive(Debug)]
pub struct StateStore {
    root: PathBuf,
    state: WorkflowState,
    notices: Vec<String>,
}

impl StateStore {
    pub fn open(root: &Path) -> Result<Self> {
        let path = paths::state_path(root);
        if !path.exists() {
            return Err(SpecflowError::NotInitialized);
        }
        let text = std::fs::read_to_string(&path)?;
        let (state, notices) = parse_document(&text)?;
        for notice in &notices {
            tracing::warn!(path = %path.display(), "{notice}");
        }
        Ok(Self {
            root: root.to_path_buf(),
            state,
            notices,
        })
    }

    /// Write a fresh document. Fails if one already exists.
    pub fn create(root: &Path) -> Result<Self> {
        let path = paths::state_path(root);
        if path.exists() {
            return Err(SpecflowError::AlreadyInitialized(
                paths::STATE_FILE.to_string(),
            ));
        }
        let state = WorkflowState::new();
        save(&path, &state)?;
        tracing::info!(path = %path.display(), "created state document");
        Ok(Self {
            root: root.to_path_buf(),
            state,
            notices: Vec::new(),
        })
    }

    /// Recovery path for an unreadable document: move it aside to `*.bak`
    /// and start over.
    pub fn reinitialize(root: &Path) -> Result<Self> {
        let path = paths::state_path(root);
        if path.exists() {
            let backup = path.with_extension("json.bak");
            std::fs::rename(&path, &backup)?;
            tracing::warn!(backup = %backup.display(), "previous state document moved aside");
        }
        Self::create(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Problems tolerated while loading.
    pub fn notices(&self) -> &[String] {
        &self.notices
    }

    pub fn get(&self, key_path: &str) -> Result<Option<Value>> {
        let segments = split_key_path(key_path)?;
        let doc = serde_json::to_value(&self.state)?;
        Ok(lookup(&doc, &segments).cloned())
    }

    /// Set a single value by dotted key path and persist.
    ///
    /// The result is re-typed against the schema, so a value of the wrong
    /// shape is rejected before anything is written.
    pub fn set(&mut self, key_path: &str, value: Value) -> Result<()> {
        let segments = split_key_path(key_path)?;
        if MANAGED_KEYS.contains(&segments[0]) {
            return Err(SpecflowError::InvalidValue {
                key: key_path.to_string(),
                reason: "managed by the state store".to_string(),
            });
        }
        if let ["orchestration", "steps", step, ..] = segments.as_slice() {
            step.parse::<StepName>()?;
        }
        let mut doc = serde_json::to_value(&self.state)?;
        assign(&mut doc, &segments, value, key_path)?;
        let next: WorkflowState =
            serde_json::from_value(doc).map_err(|e| SpecflowError::InvalidValue {
                key: key_path.to_string(),
                reason: e.to_string(),
            })?;
        check_transitions(&self.state, &next)?;
        self.commit(next)
    }

    pub fn touch(&mut self) -> Result<()> {
        let next = self.state.clone();
        self.commit(next)
    }

    /// Apply `f` to a copy of the state, enforce step transitions, persist.
    pub fn update<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut WorkflowState) -> Result<()>,
    {
        let mut next = self.state.clone();
        f(&mut next)?;
        check_transitions(&self.state, &next)?;
        self.commit(next)
    }

    /// Make `number` the active phase with every step `pending`.
    pub fn start_phase(&mut self, number: &str, name: Option<&str>, branch: Option<&str>) -> Result<()> {
        paths::validate_phase_number(number)?;
        let mut next = self.state.clone();
        next.orchestration = Orchestration {
            phase_number: Some(number.to_string()),
            phase_name: name.map(str::to_string),
            branch: branch.map(str::to_string),
            status: OrchestrationStatus::InProgress,
            steps: StepName::all()
                .iter()
                .map(|s| (*s, StepState::default()))
                .collect(),
        };
        tracing::info!(phase = number, "phase started");
        self.commit(next)
    }

    /// Explicit operator action returning a step to `pending`. This is the
    /// only way out of `failed` or `completed`.
    pub fn reset_step(&mut self, step: StepName) -> Result<()> {
        let mut next = self.state.clone();
        let entry = next.orchestration.steps.entry(step).or_default();
        let previous = entry.status;
        *entry = StepState {
            tasks_completed: entry.tasks_completed,
            tasks_total: entry.tasks_total,
            ..StepState::default()
        };
        tracing::info!(%step, from = %previous, "step reset to pending");
        self.commit(next)
    }

    fn commit(&mut self, mut next: WorkflowState) -> Result<()> {
        let now = Utc::now();
        next.normalize(now);
        next.last_updated = now;
        save(&paths::state_path(&self.root), &next)?;
        self.state = next;
        Ok(())
    }
}

fn check_transitions(current: &WorkflowState, next: &WorkflowState) -> Result<()> {
    for step in StepName::all() {
        let from = current.step_status(*step);
        let to = next.step_status(*step);
        if !from.can_advance_to(to) {
            return Err(SpecflowError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
                reason: format!("step '{step}' only moves forward; use 'specflow state reset-step {step}'"),
            });
        }
    }
    Ok(())
}

fn save(path: &Path, state: &WorkflowState) -> Result<()> {
    let mut data = serde_json::to_string_pretty(state)?;
    data.push('\n');
    crate::io::atomic_write(path, data.as_bytes())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let store = StateStore::create(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn create_then_open_roundtrip() {
        let (dir, mut store) = store();
        store.start_phase("0010", Some("Core"), Some("0010-core")).unwrap();
        let loaded = StateStore::open(dir.path()).unwrap();
        assert_eq!(loaded.state().active_phase(), Some("0010"));
        assert_eq!(loaded.state().orchestration.steps.len(), StepName::all().len());
        assert!(loaded.notices().is_empty());
    }

    #[test]
    fn open_without_document_is_not_initialized() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(StateStore::open(dir.path()), Err(SpecflowError::NotInitialized)));
    }

    #[test]
    fn malformed_document_is_schema_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".specify")).unwrap();
        std::fs::write(paths::state_path(dir.path()), "{ not json").unwrap();
        let err = StateStore::open(dir.path()).unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn missing_version_is_schema_error() {
        let err = parse_document(r#"{"interview": {}}"#).unwrap_err();
        assert!(matches!(err, SpecflowError::Schema { .. }));
        let err = parse_document(r#"{"schemaVersion": "banana"}"#).unwrap_err();
        assert!(matches!(err, SpecflowError::Schema { .. }));
        let err = parse_document("[1, 2]").unwrap_err();
        assert!(matches!(err, SpecflowError::Schema { .. }));
    }

    #[test]
    fn missing_sections_are_reported_not_fatal() {
        let (state, notices) = parse_document(
            r#"{"schemaVersion": "2.0", "orchestration": {"phaseNumber": "0010"}}"#,
        )
        .unwrap();
        assert_eq!(state.active_phase(), Some("0010"));
        assert_eq!(state.config, PathSettings::default());
        assert!(notices.iter().any(|n| n.contains("'interview'")));
        assert!(notices.iter().any(|n| n.contains("'config'")));
        assert!(!notices.iter().any(|n| n.contains("'orchestration'")));
    }

    #[test]
    fn camel_case_document_loads() {
        let (state, notices) = parse_document(
            r#"{
                "schemaVersion": "2.0",
                "config": {"roadmap": "docs/ROADMAP.md", "specsRoot": "features"},
                "interview": {"status": "in_progress", "currentPhase": 2, "decisionsCount": 5},
                "orchestration": {
                    "phaseNumber": "0010",
                    "branch": "0010-core",
                    "status": "in_progress",
                    "steps": {
                        "specify": {"status": "completed", "completedAt": "2026-01-02T03:04:05Z", "artifacts": ["specs/0010-core/spec.md"]},
                        "implement": {"status": "in_progress", "tasksCompleted": 3, "tasksTotal": 5}
                    }
                },
                "lastUpdated": "2026-01-02T03:04:05Z"
            }"#,
        )
        .unwrap();
        assert!(notices.is_empty(), "{notices:?}");
        assert_eq!(state.active_phase(), Some("0010"));
        assert_eq!(state.config.specs_root, "features");
        assert_eq!(state.interview.current_phase, 2);
        assert_eq!(state.interview.decisions_count, 5);
        assert!(state.step(StepName::Specify).unwrap().completed_at.is_some());
        assert_eq!(state.task_tally(), Some(TaskTally::new(3, 5)));

        let written = serde_json::to_value(&state).unwrap();
        assert_eq!(written["orchestration"]["phaseNumber"], "0010");
        assert_eq!(written["config"]["specsRoot"], "features");
        assert!(written.get("lastUpdated").is_some());
        assert!(written.get("last_updated").is_none());
    }

    #[test]
    fn unknown_steps_tolerated_and_dropped_on_write() {
        let dir = TempDir::new().unwrap();
        let doc = json!({
            "schemaVersion": "2.0",
            "orchestration": { "steps": {
                "plan": { "status": "in_progress" },
                "deploy": { "status": "weird", "anything": true }
            }}
        });
        crate::io::atomic_write(&paths::state_path(dir.path()), doc.to_string().as_bytes()).unwrap();
        let mut store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.state().step_status(StepName::Plan), StepStatus::InProgress);
        store.touch().unwrap();
        let written = std::fs::read_to_string(paths::state_path(dir.path())).unwrap();
        assert!(!written.contains("deploy"));
    }

    #[test]
    fn unknown_top_level_keys_preserved() {
        let dir = TempDir::new().unwrap();
        let doc = json!({ "schemaVersion": "2.0", "dashboard": { "port": 4000 } });
        crate::io::atomic_write(&paths::state_path(dir.path()), doc.to_string().as_bytes()).unwrap();
        let mut store = StateStore::open(dir.path()).unwrap();
        store.set("interview.currentPhase", json!(2)).unwrap();
        let reloaded = StateStore::open(dir.path()).unwrap();
        assert_eq!(reloaded.get("dashboard.port").unwrap(), Some(json!(4000)));
        assert_eq!(reloaded.state().interview.current_phase, 2);
    }

    #[test]
    fn v1_document_migrated_on_open() {
        let dir = TempDir::new().unwrap();
        let doc = json!({
            "schemaVersion": "1.0",
            "orchestration": { "phase": { "number": "042", "branch": "042-core" } }
        });
        crate::io::atomic_write(&paths::state_path(dir.path()), doc.to_string().as_bytes()).unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        assert_eq!(store.state().schema_version, "2.0");
        assert_eq!(store.state().orchestration.branch.as_deref(), Some("042-core"));
    }

    #[test]
    fn get_and_set_by_key_path() {
        let (_dir, mut store) = store();
        store.set("orchestration.branch", json!("0010-core")).unwrap();
        assert_eq!(store.get("orchestration.branch").unwrap(), Some(json!("0010-core")));
        assert_eq!(store.get("orchestration.nope").unwrap(), None);
        assert!(store.get("orchestration..branch").is_err());
    }

    #[test]
    fn set_rejects_wrong_shape_without_writing() {
        let (dir, mut store) = store();
        let before = std::fs::read_to_string(paths::state_path(dir.path())).unwrap();
        let err = store.set("interview.status", json!("finished")).unwrap_err();
        assert!(matches!(err, SpecflowError::InvalidValue { .. }));
        let after = std::fs::read_to_string(paths::state_path(dir.path())).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn set_rejects_unknown_step_and_managed_keys() {
        let (_dir, mut store) = store();
        assert!(matches!(
            store.set("orchestration.steps.deploy.status", json!("pending")),
            Err(SpecflowError::UnknownStep(_))
        ));
        assert!(store.set("schemaVersion", json!("9.9")).is_err());
        assert!(store.set("lastUpdated", json!("2020-01-01T00:00:00Z")).is_err());
    }

    #[test]
    fn completed_step_gets_completed_at() {
        let (_dir, mut store) = store();
        store.start_phase("0010", None, None).unwrap();
        store.set("orchestration.steps.specify.status", json!("completed")).unwrap();
        let step = store.state().step(StepName::Specify).unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.completed_at.is_some());
    }

    #[test]
    fn failed_step_needs_explicit_reset() {
        let (_dir, mut store) = store();
        store.start_phase("0010", None, None).unwrap();
        store.set("orchestration.steps.plan.status", json!("failed")).unwrap();
        let err = store.set("orchestration.steps.plan.status", json!("pending")).unwrap_err();
        assert!(matches!(err, SpecflowError::InvalidTransition { .. }));
        store.reset_step(StepName::Plan).unwrap();
        assert_eq!(store.state().step_status(StepName::Plan), StepStatus::Pending);
    }

    #[test]
    fn touch_advances_last_updated() {
        let (_dir, mut store) = store();
        let before = store.state().last_updated;
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.touch().unwrap();
        assert!(store.state().last_updated > before);
    }

    #[test]
    fn reinitialize_backs_up_corrupt_document() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".specify")).unwrap();
        std::fs::write(paths::state_path(dir.path()), "garbage").unwrap();
        let store = StateStore::reinitialize(dir.path()).unwrap();
        assert_eq!(store.state().schema_version, "2.0");
        let backup = dir.path().join(".specify/orchestration-state.json.bak");
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "garbage");
    }

    #[test]
    fn next_step_follows_lifecycle_order() {
        let (_dir, mut store) = store();
        store.start_phase("0010", None, None).unwrap();
        assert_eq!(store.state().next_step(), Some(StepName::Specify));
        store
            .update(|s| {
                s.orchestration.steps.entry(StepName::Specify).or_default().status =
                    StepStatus::Completed;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.state().next_step(), Some(StepName::Clarify));
    }

    #[test]
    fn start_phase_validates_number() {
        let (_dir, mut store) = store();
        assert!(matches!(
            store.start_phase("10", None, None),
            Err(SpecflowError::InvalidPhaseNumber(_))
        ));
    }
}
