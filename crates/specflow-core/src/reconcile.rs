//! Drift detection between the state document and the artifact store.
//!
//! [`Reconciler::diff`] runs every comparison and never writes.
//! [`Reconciler::reconcile`] applies the repairable subset when files are
//! trusted; trusting state only reports. Repairs never claim more progress
//! than the files prove: a pending step with an artifact moves to
//! `in_progress`, never `completed`.

use crate::error::Result;
use crate::gate::resolve_phase_dir;
use crate::inspector::{self, TaskTally};
use crate::paths;
use crate::roadmap;
use crate::state::{StateStore, WorkflowState};
use crate::types::{InterviewStatus, StepName, StepStatus, TrustMode};
use crate::vcs::VersionControl;
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::Path;

// ---------------------------------------------------------------------------
// Difference
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftArea {
    Tasks,
    Branch,
    Step(StepName),
    Interview,
    PhaseStorage,
}

impl fmt::Display for DriftArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftArea::Tasks => f.write_str("tasks"),
            DriftArea::Branch => f.write_str("branch"),
            DriftArea::Step(step) => write!(f, "step.{step}"),
            DriftArea::Interview => f.write_str("interview"),
            DriftArea::PhaseStorage => f.write_str("phase_storage"),
        }
    }
}

impl Serialize for DriftArea {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// Both sides hold a value and they disagree.
    Mismatch,
    /// The state claims more progress than the files show.
    Overstated,
    /// The files show more progress than the state records.
    Understated,
    /// The files contradict each other.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Difference {
    pub area: DriftArea,
    pub kind: DriftKind,
    #[serde(rename = "recordedValue")]
    pub recorded: Option<String>,
    #[serde(rename = "observedValue")]
    pub observed: Option<String>,
    pub description: String,
    pub repairable: bool,
}

/// A repair applied (or, on a dry run, that would be applied) to the state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fix {
    pub area: DriftArea,
    pub from: Option<String>,
    pub to: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub trust: TrustMode,
    pub dry_run: bool,
    pub applied: Vec<Fix>,
    /// Drift left unresolved after this run.
    pub reported: Vec<Difference>,
}

impl ReconcileOutcome {
    pub fn in_sync(&self) -> bool {
        self.reported.is_empty() && (self.applied.is_empty() || !self.dry_run)
    }
}

#[derive(Debug, Clone)]
enum Repair {
    Tally(TaskTally),
    Branch(String),
    AdvanceStep { step: StepName, artifact: String },
    Interview(InterviewStatus),
}

struct Drift {
    difference: Difference,
    repair: Option<Repair>,
}

impl Drift {
    fn new(
        area: DriftArea,
        kind: DriftKind,
        recorded: Option<String>,
        observed: Option<String>,
        description: String,
        repair: Option<Repair>,
    ) -> Self {
        Self {
            difference: Difference {
                area,
                kind,
                recorded,
                observed,
                description,
                repairable: repair.is_some(),
            },
            repair,
        }
    }

    fn fix(&self) -> Option<Fix> {
        let to = match self.repair.as_ref()? {
            Repair::Tally(tally) => tally.to_string(),
            Repair::Branch(branch) => branch.clone(),
            Repair::AdvanceStep { .. } => StepStatus::InProgress.to_string(),
            Repair::Interview(status) => status.to_string(),
        };
        Some(Fix {
            area: self.difference.area,
            from: self.difference.recorded.clone(),
            to,
            description: self.difference.description.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler<'a> {
    root: &'a Path,
    vcs: &'a dyn VersionControl,
}

impl<'a> Reconciler<'a> {
    pub fn new(root: &'a Path, vcs: &'a dyn VersionControl) -> Self {
        Self { root, vcs }
    }

    /// Every difference between `state` and the files, in a fixed order:
    /// tasks, branch, steps, interview, phase storage.
    pub fn diff(&self, state: &WorkflowState) -> Vec<Difference> {
        self.detect(state).into_iter().map(|d| d.difference).collect()
    }

    pub fn reconcile(
        &self,
        store: &mut StateStore,
        trust: TrustMode,
        dry_run: bool,
    ) -> Result<ReconcileOutcome> {
        let drift = self.detect(store.state());
        let mut outcome = ReconcileOutcome {
            trust,
            dry_run,
            applied: Vec::new(),
            reported: Vec::new(),
        };

        if trust == TrustMode::State {
            outcome.reported = drift.into_iter().map(|d| d.difference).collect();
            return Ok(outcome);
        }

        let (repairable, unrepairable): (Vec<Drift>, Vec<Drift>) =
            drift.into_iter().partition(|d| d.repair.is_some());
        outcome.reported = unrepairable.into_iter().map(|d| d.difference).collect();
        outcome.applied = repairable.iter().filter_map(Drift::fix).collect();

        if dry_run || repairable.is_empty() {
            return Ok(outcome);
        }

        store.update(|state| {
            for drift in &repairable {
                if let Some(repair) = &drift.repair {
                    apply_repair(state, repair);
                }
            }
            Ok(())
        })?;
        tracing::info!(fixes = outcome.applied.len(), "state reconciled from files");
        Ok(outcome)
    }

    fn detect(&self, state: &WorkflowState) -> Vec<Drift> {
        let mut drift = Vec::new();
        if let Some(number) = state.active_phase() {
            let phase_dir = resolve_phase_dir(self.root, &state.config, number);
            drift.extend(self.task_drift(state, &phase_dir));
            drift.extend(self.branch_drift(state));
            drift.extend(self.step_drift(state, &phase_dir));
        }
        drift.extend(self.interview_drift(state));
        drift.extend(self.storage_drift(state));
        tracing::debug!(count = drift.len(), "drift detection finished");
        drift
    }

    fn task_drift(&self, state: &WorkflowState, phase_dir: &Path) -> Option<Drift> {
        let observed = inspector::count_checkboxes(&phase_dir.join(paths::TASKS_MD));
        let recorded = state.task_tally();
        let unchanged = match recorded {
            Some(r) => r == observed,
            None => observed.total == 0,
        };
        if unchanged {
            return None;
        }
        let description = match recorded {
            Some(r) => format!("state records {r} tasks complete, tasks.md shows {observed}"),
            None => format!("state records no task tally, tasks.md shows {observed}"),
        };
        Some(Drift::new(
            DriftArea::Tasks,
            DriftKind::Mismatch,
            recorded.map(|r| r.to_string()),
            Some(observed.to_string()),
            description,
            Some(Repair::Tally(observed)),
        ))
    }

    fn branch_drift(&self, state: &WorkflowState) -> Option<Drift> {
        let observed = self.vcs.current_branch()?;
        let recorded = state.orchestration.branch.clone();
        if recorded.as_deref() == Some(observed.as_str()) {
            return None;
        }
        let description = match &recorded {
            Some(r) => format!("state records branch '{r}', checkout is on '{observed}'"),
            None => format!("state records no branch, checkout is on '{observed}'"),
        };
        Some(Drift::new(
            DriftArea::Branch,
            DriftKind::Mismatch,
            recorded,
            Some(observed.clone()),
            description,
            Some(Repair::Branch(observed)),
        ))
    }

    fn step_drift(&self, state: &WorkflowState, phase_dir: &Path) -> Vec<Drift> {
        let mut drift = Vec::new();
        for step in [StepName::Specify, StepName::Plan, StepName::Tasks] {
            let Some(artifact) = step.artifact() else {
                continue;
            };
            let path = phase_dir.join(artifact);
            let present = inspector::is_non_empty(&path);
            let status = state.step_status(step);
            let area = DriftArea::Step(step);
            match (status, present) {
                (StepStatus::Completed, false) => drift.push(Drift::new(
                    area,
                    DriftKind::Overstated,
                    Some(status.to_string()),
                    Some("missing".to_string()),
                    format!("step '{step}' is completed but {artifact} is missing; re-run the step"),
                    None,
                )),
                (StepStatus::Pending, true) => {
                    let rel = path.strip_prefix(self.root).unwrap_or(&path);
                    drift.push(Drift::new(
                        area,
                        DriftKind::Understated,
                        Some(status.to_string()),
                        Some("present".to_string()),
                        format!("step '{step}' is pending but {artifact} exists"),
                        Some(Repair::AdvanceStep {
                            step,
                            artifact: rel.to_string_lossy().to_string(),
                        }),
                    ))
                }
                _ => {}
            }
        }
        drift
    }

    fn interview_drift(&self, state: &WorkflowState) -> Option<Drift> {
        let observed = observed_interview(self.root, state);
        let recorded = state.interview.status;
        if recorded == observed {
            return None;
        }
        let (kind, description, repair) = if recorded > observed {
            (
                DriftKind::Overstated,
                format!("interview is recorded as {recorded} but discovery files only support {observed}"),
                None,
            )
        } else {
            (
                DriftKind::Understated,
                format!("discovery files show the interview is {observed}, state records {recorded}"),
                Some(Repair::Interview(observed)),
            )
        };
        Some(Drift::new(
            DriftArea::Interview,
            kind,
            Some(recorded.to_string()),
            Some(observed.to_string()),
            description,
            repair,
        ))
    }

    fn storage_drift(&self, state: &WorkflowState) -> Vec<Drift> {
        roadmap::storage_conflicts(self.root, &state.config)
            .into_iter()
            .map(|c| {
                let file = c.file.strip_prefix(self.root).unwrap_or(&c.file).display().to_string();
                Drift::new(
                    DriftArea::PhaseStorage,
                    DriftKind::Conflict,
                    Some(format!("{}:{}", state.config.roadmap, c.inline_line)),
                    Some(file),
                    format!(
                        "phase {} is stored both inline in the roadmap and in a phase file; keep one",
                        c.number
                    ),
                    None,
                )
            })
            .collect()
    }
}

/// Interview progress the files support: a constitution means completed,
/// any discovery document means in progress.
fn observed_interview(root: &Path, state: &WorkflowState) -> InterviewStatus {
    if inspector::is_non_empty(&state.config.constitution_path(root)) {
        return InterviewStatus::Completed;
    }
    let discovery = state.config.discovery_root(root);
    if paths::DISCOVERY_FILES
        .iter()
        .any(|f| inspector::is_non_empty(&discovery.join(f)))
    {
        return InterviewStatus::InProgress;
    }
    InterviewStatus::NotStarted
}

fn apply_repair(state: &mut WorkflowState, repair: &Repair) {
    match repair {
        Repair::Tally(tally) => state
            .orchestration
            .steps
            .entry(StepName::Implement)
            .or_default()
            .set_tally(*tally),
        Repair::Branch(branch) => state.orchestration.branch = Some(branch.clone()),
        Repair::AdvanceStep { step, artifact } => {
            let entry = state.orchestration.steps.entry(*step).or_default();
            entry.status = StepStatus::InProgress;
            if !entry.artifacts.contains(artifact) {
                entry.artifacts.push(artifact.clone());
            }
        }
        Repair::Interview(status) => state.interview.status = *status,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::FixedVcs;
    use tempfile::TempDir;

    fn project() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::create(dir.path()).unwrap();
        store.start_phase("0010", Some("Core"), Some("0010-core")).unwrap();
        std::fs::create_dir_all(dir.path().join("specs/0010-core")).unwrap();
        (dir, store)
    }

    fn write(dir: &TempDir, rel: &str, body: &str) {
        let path = dir.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn set_tally(store: &mut StateStore, completed: u32, total: u32) {
        store
            .update(|s| {
                s.orchestration
                    .steps
                    .entry(StepName::Implement)
                    .or_default()
                    .set_tally(TaskTally::new(completed, total));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn clean_project_has_no_drift() {
        let (dir, store) = project();
        let vcs = FixedVcs::on_branch("0010-core");
        assert!(Reconciler::new(dir.path(), &vcs).diff(store.state()).is_empty());
    }

    #[test]
    fn task_count_scenario() {
        let (dir, mut store) = project();
        set_tally(&mut store, 3, 5);
        store
            .update(|s| {
                s.orchestration.steps.entry(StepName::Tasks).or_default().status =
                    StepStatus::InProgress;
                Ok(())
            })
            .unwrap();
        write(
            &dir,
            "specs/0010-core/tasks.md",
            "## Phase 1\n- [x] T001\n- [x] T002\n- [x] T003\n- [x] T004\n- [ ] T005\n",
        );
        let vcs = FixedVcs::on_branch("0010-core");
        let rec = Reconciler::new(dir.path(), &vcs);

        let diff = rec.diff(store.state());
        assert_eq!(diff.len(), 1, "{diff:?}");
        assert_eq!(diff[0].area, DriftArea::Tasks);
        assert_eq!(diff[0].recorded.as_deref(), Some("3/5"));
        assert_eq!(diff[0].observed.as_deref(), Some("4/5"));

        let outcome = rec.reconcile(&mut store, TrustMode::Files, false).unwrap();
        assert_eq!(outcome.applied.len(), 1);
        assert!(outcome.in_sync());
        assert_eq!(store.state().task_tally(), Some(TaskTally::new(4, 5)));
        assert!(rec.diff(store.state()).is_empty());

        let reloaded = StateStore::open(dir.path()).unwrap();
        assert_eq!(reloaded.state().task_tally(), Some(TaskTally::new(4, 5)));
    }

    #[test]
    fn completed_step_with_missing_artifact_is_never_repaired() {
        let (dir, mut store) = project();
        store
            .update(|s| {
                s.orchestration.steps.entry(StepName::Specify).or_default().status =
                    StepStatus::Completed;
                Ok(())
            })
            .unwrap();
        let vcs = FixedVcs::on_branch("0010-core");
        let rec = Reconciler::new(dir.path(), &vcs);

        for trust in [TrustMode::Files, TrustMode::State] {
            let outcome = rec.reconcile(&mut store, trust, false).unwrap();
            assert!(outcome.applied.is_empty());
            assert_eq!(outcome.reported.len(), 1);
            let d = &outcome.reported[0];
            assert_eq!(d.area, DriftArea::Step(StepName::Specify));
            assert_eq!(d.kind, DriftKind::Overstated);
            assert!(!d.repairable);
            assert!(!outcome.in_sync());
        }
        assert_eq!(store.state().step_status(StepName::Specify), StepStatus::Completed);
    }

    #[test]
    fn pending_step_with_artifact_moves_to_in_progress() {
        let (dir, mut store) = project();
        write(&dir, "specs/0010-core/spec.md", "## Overview\n");
        let vcs = FixedVcs::on_branch("0010-core");
        let rec = Reconciler::new(dir.path(), &vcs);

        let outcome = rec.reconcile(&mut store, TrustMode::Files, false).unwrap();
        assert_eq!(outcome.applied[0].to, "in_progress");
        let step = store.state().step(StepName::Specify).unwrap();
        assert_eq!(step.status, StepStatus::InProgress);
        assert!(step.completed_at.is_none());
        assert_eq!(step.artifacts, vec!["specs/0010-core/spec.md"]);
    }

    #[test]
    fn branch_drift_repaired_under_files() {
        let (dir, mut store) = project();
        let vcs = FixedVcs::on_branch("feature/other");
        let rec = Reconciler::new(dir.path(), &vcs);
        let diff = rec.diff(store.state());
        assert_eq!(diff[0].area, DriftArea::Branch);
        assert_eq!(diff[0].recorded.as_deref(), Some("0010-core"));

        rec.reconcile(&mut store, TrustMode::Files, false).unwrap();
        assert_eq!(store.state().orchestration.branch.as_deref(), Some("feature/other"));
    }

    #[test]
    fn unknown_branch_is_not_drift() {
        let (dir, store) = project();
        let vcs = FixedVcs::default();
        assert!(Reconciler::new(dir.path(), &vcs).diff(store.state()).is_empty());
    }

    #[test]
    fn interview_asymmetry() {
        let (dir, mut store) = project();
        let vcs = FixedVcs::on_branch("0010-core");
        let rec = Reconciler::new(dir.path(), &vcs);

        write(&dir, ".specify/discovery/context.md", "# Context\n");
        let diff = rec.diff(store.state());
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].kind, DriftKind::Understated);
        assert!(diff[0].repairable);
        rec.reconcile(&mut store, TrustMode::Files, false).unwrap();
        assert_eq!(store.state().interview.status, InterviewStatus::InProgress);

        store.set("interview.status", serde_json::json!("completed")).unwrap();
        let diff = rec.diff(store.state());
        assert_eq!(diff[0].kind, DriftKind::Overstated);
        let outcome = rec.reconcile(&mut store, TrustMode::Files, false).unwrap();
        assert_eq!(outcome.reported.len(), 1);
        assert_eq!(store.state().interview.status, InterviewStatus::Completed);

        write(&dir, ".specify/memory/constitution.md", "# Principles\n");
        assert!(rec.diff(store.state()).is_empty());
    }

    #[test]
    fn trust_state_never_writes() {
        let (dir, mut store) = project();
        set_tally(&mut store, 0, 2);
        write(&dir, "specs/0010-core/tasks.md", "- [x] T001\n- [x] T002\n");
        let before = std::fs::read_to_string(paths::state_path(dir.path())).unwrap();
        let vcs = FixedVcs::on_branch("other");
        let outcome = Reconciler::new(dir.path(), &vcs)
            .reconcile(&mut store, TrustMode::State, false)
            .unwrap();
        assert!(outcome.applied.is_empty());
        assert!(outcome.reported.len() >= 3);
        assert_eq!(std::fs::read_to_string(paths::state_path(dir.path())).unwrap(), before);
    }

    #[test]
    fn dry_run_lists_fixes_without_writing() {
        let (dir, mut store) = project();
        set_tally(&mut store, 0, 1);
        write(&dir, "specs/0010-core/tasks.md", "- [x] T001\n");
        let before = std::fs::read_to_string(paths::state_path(dir.path())).unwrap();
        let vcs = FixedVcs::on_branch("0010-core");
        let outcome = Reconciler::new(dir.path(), &vcs)
            .reconcile(&mut store, TrustMode::Files, true)
            .unwrap();
        assert_eq!(outcome.applied.len(), 2);
        assert!(!outcome.in_sync());
        assert_eq!(std::fs::read_to_string(paths::state_path(dir.path())).unwrap(), before);
    }

    #[test]
    fn reconcile_files_is_idempotent() {
        let (dir, mut store) = project();
        set_tally(&mut store, 1, 9);
        write(&dir, "specs/0010-core/spec.md", "## Overview\n");
        write(&dir, "specs/0010-core/plan.md", "## Summary\n");
        write(&dir, "specs/0010-core/tasks.md", "## Phase 1\n- [x] T001\n- [ ] T002\n");
        write(&dir, ".specify/memory/constitution.md", "# Principles\n");
        let vcs = FixedVcs::on_branch("0010-other");
        let rec = Reconciler::new(dir.path(), &vcs);

        let first = rec.reconcile(&mut store, TrustMode::Files, false).unwrap();
        assert_eq!(first.applied.len(), 6);
        let second = rec.reconcile(&mut store, TrustMode::Files, false).unwrap();
        assert!(second.applied.is_empty());
        assert!(second.reported.is_empty());
        assert!(rec.diff(store.state()).is_empty());
    }

    #[test]
    fn phase_storage_conflict_reported() {
        let (dir, store) = project();
        write(&dir, "ROADMAP.md", "| 0010 | Core | |\n\n### 0010 - Core\n");
        write(&dir, ".specify/phases/0010-core.md", "# Core\n");
        let vcs = FixedVcs::on_branch("0010-core");
        let diff = Reconciler::new(dir.path(), &vcs).diff(store.state());
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].area, DriftArea::PhaseStorage);
        assert_eq!(diff[0].kind, DriftKind::Conflict);
        assert_eq!(diff[0].recorded.as_deref(), Some("ROADMAP.md:3"));
    }

    #[test]
    fn area_serializes_as_path() {
        let json = serde_json::to_string(&DriftArea::Step(StepName::Plan)).unwrap();
        assert_eq!(json, "\"step.plan\"");
    }
}
