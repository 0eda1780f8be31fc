use crate::config::Config;
use crate::error::Result;
use crate::inspector::{ArtifactView, PlaceholderMatch, SectionCheck, TaskTally};
use crate::paths::{self, PathSettings};
use crate::state::{StateStore, WorkflowState};
use crate::test_runner::{TestOutcome, TestRunner};
use crate::types::{StepName, StepStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// GateKind
// ---------------------------------------------------------------------------

/// The four steps whose artifacts are validated before the step counts as done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Specify,
    Plan,
    Tasks,
    Implement,
}

impl GateKind {
    pub fn all() -> &'static [GateKind] {
        &[GateKind::Specify, GateKind::Plan, GateKind::Tasks, GateKind::Implement]
    }

    pub fn as_str(self) -> &'static str {
        self.step().as_str()
    }

    pub fn from_name(s: &str) -> Option<GateKind> {
        Self::all().iter().copied().find(|g| g.as_str() == s)
    }

    /// `None` for the pass-through steps (clarify, analyze, checklist, verify).
    pub fn for_step(step: StepName) -> Option<GateKind> {
        match step {
            StepName::Specify => Some(GateKind::Specify),
            StepName::Plan => Some(GateKind::Plan),
            StepName::Tasks => Some(GateKind::Tasks),
            StepName::Implement => Some(GateKind::Implement),
            _ => None,
        }
    }

    pub fn step(self) -> StepName {
        match self {
            GateKind::Specify => StepName::Specify,
            GateKind::Plan => StepName::Plan,
            GateKind::Tasks => StepName::Tasks,
            GateKind::Implement => StepName::Implement,
        }
    }

    pub fn artifact(self) -> &'static str {
        match self {
            GateKind::Specify => paths::SPEC_MD,
            GateKind::Plan => paths::PLAN_MD,
            GateKind::Tasks | GateKind::Implement => paths::TASKS_MD,
        }
    }

    fn default_sections(self) -> &'static [(&'static str, &'static str)] {
        match self {
            GateKind::Specify => &[
                ("Overview", r"^## (Overview|Summary)"),
                ("User Scenarios", r"^## User (Scenarios|Stories)"),
                ("Requirements", r"^## (Functional )?Requirements"),
                ("Success Criteria", r"^## Success Criteria"),
            ],
            GateKind::Plan => &[
                ("Summary", r"^## Summary"),
                ("Technical Context", r"^## Technical Context"),
                ("Project Structure", r"^## Project Structure"),
            ],
            GateKind::Tasks | GateKind::Implement => &[],
        }
    }
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Severity / Verdict / Finding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        })
    }
}

/// Ordered from best to worst so the aggregate of several verdicts is `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    PassWithWarnings,
    Fail,
}

impl Verdict {
    /// Any error fails. Warnings alone pass, unless `strict` escalates them.
    pub fn from_findings(findings: &[Finding], strict: bool) -> Verdict {
        let has = |sev| findings.iter().any(|f| f.severity == sev);
        if has(Severity::Error) {
            Verdict::Fail
        } else if !has(Severity::Warning) {
            Verdict::Pass
        } else if strict {
            Verdict::Fail
        } else {
            Verdict::PassWithWarnings
        }
    }

    pub fn is_passing(self) -> bool {
        self != Verdict::Fail
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Pass => "PASS",
            Verdict::PassWithWarnings => "PASS_WITH_WARNINGS",
            Verdict::Fail => "FAIL",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    ArtifactMissing,
    SectionMissing,
    Placeholder,
    PhaseHeadingMissing,
    TaskLineMissing,
    PlaceholderTaskId,
    TasksIncomplete,
    TestsFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub check: Check,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<PlaceholderMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
}

impl Finding {
    fn new(severity: Severity, check: Check, message: impl Into<String>) -> Self {
        Self {
            severity,
            check,
            message: message.into(),
            samples: Vec::new(),
            context: Vec::new(),
        }
    }

    fn error(check: Check, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, check, message)
    }

    fn warning(check: Check, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, check, message)
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// One gate's checks, resolved from the built-in defaults plus config.
#[derive(Debug, Clone)]
pub struct Gate {
    pub kind: GateKind,
    pub sections: Vec<SectionCheck>,
    pub scan_placeholders: bool,
}

impl Gate {
    pub fn builtin(kind: GateKind) -> Gate {
        let sections = kind
            .default_sections()
            .iter()
            .map(|(name, pattern)| {
                SectionCheck::new(*name, pattern).expect("built-in section patterns compile")
            })
            .collect();
        Gate {
            kind,
            sections,
            scan_placeholders: true,
        }
    }

    pub fn configured(kind: GateKind, cfg: &Config) -> Result<Gate> {
        let mut gate = Gate::builtin(kind);
        if let Some(over) = cfg.gate_override(kind) {
            if let Some(specs) = &over.sections {
                gate.sections = specs.iter().map(|s| s.compile()).collect::<Result<_>>()?;
            }
            if let Some(scan) = over.placeholders {
                gate.scan_placeholders = scan;
            }
        }
        Ok(gate)
    }

    /// Every finding for `view`, in check order. Stops early only when the
    /// artifact is absent, since nothing else can be checked.
    pub fn check(&self, view: &ArtifactView, tests: Option<&TestOutcome>) -> Vec<Finding> {
        let mut findings = Vec::new();
        let artifact = self.kind.artifact();

        if !view.is_present() {
            let what = if view.exists { "empty" } else { "missing" };
            findings.push(Finding::error(
                Check::ArtifactMissing,
                format!("{artifact} is {what}"),
            ));
            return findings;
        }

        for section in view.missing_sections() {
            findings.push(Finding::warning(
                Check::SectionMissing,
                format!("{artifact}: missing section '{section}'"),
            ));
        }

        if self.scan_placeholders {
            for (token, count) in &view.placeholders.counts {
                let mut finding = Finding::warning(
                    Check::Placeholder,
                    format!("{artifact}: {count} unresolved {token} placeholder(s)"),
                );
                finding.samples = view.placeholders.samples_for(token).cloned().collect();
                findings.push(finding);
            }
        }

        match self.kind {
            GateKind::Tasks => {
                if view.phase_headings == 0 {
                    findings.push(Finding::error(
                        Check::PhaseHeadingMissing,
                        "tasks.md has no '## Phase' heading",
                    ));
                }
                if view.task_lines == 0 {
                    findings.push(Finding::error(
                        Check::TaskLineMissing,
                        "tasks.md has no task line of the form '- [ ] T001 ...'",
                    ));
                }
                if view.placeholder_task_ids > 0 {
                    findings.push(Finding::warning(
                        Check::PlaceholderTaskId,
                        format!(
                            "tasks.md: {} task(s) still use the TXXX placeholder id",
                            view.placeholder_task_ids
                        ),
                    ));
                }
            }
            GateKind::Implement => {
                let incomplete = view.tally.incomplete();
                if incomplete > 0 {
                    findings.push(Finding::error(
                        Check::TasksIncomplete,
                        format!("{incomplete} of {} task(s) incomplete", view.tally.total),
                    ));
                }
                if let Some(outcome) = tests.filter(|t| !t.passed) {
                    let reason = if outcome.timed_out {
                        "timed out".to_string()
                    } else {
                        match outcome.exit_code {
                            Some(code) => format!("exited with {code}"),
                            None => "did not run".to_string(),
                        }
                    };
                    let mut finding = Finding::warning(
                        Check::TestsFailed,
                        format!("tests failed: '{}' {reason}", outcome.command),
                    );
                    finding.context = outcome.context.clone();
                    findings.push(finding);
                }
            }
            GateKind::Specify | GateKind::Plan => {}
        }

        findings
    }
}

// ---------------------------------------------------------------------------
// GateReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateReport {
    pub step: StepName,
    /// `false` for pass-through steps, which always pass with no findings.
    pub gated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    pub verdict: Verdict,
    pub strict: bool,
    pub errors: usize,
    pub warnings: usize,
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tally: Option<TaskTally>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestOutcome>,
}

impl GateReport {
    fn new(step: StepName, artifact: Option<PathBuf>, findings: Vec<Finding>, strict: bool) -> Self {
        let errors = findings.iter().filter(|f| f.severity == Severity::Error).count();
        Self {
            step,
            gated: artifact.is_some(),
            artifact,
            verdict: Verdict::from_findings(&findings, strict),
            strict,
            errors,
            warnings: findings.len() - errors,
            findings,
            tally: None,
            tests: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSummary {
    pub verdict: Verdict,
    pub reports: Vec<GateReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepGateStatus {
    pub step: StepName,
    pub recorded: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
}

// ---------------------------------------------------------------------------
// GateEvaluator
// ---------------------------------------------------------------------------

/// Evaluates gates against one phase directory.
pub struct GateEvaluator<'a> {
    root: &'a Path,
    phase_dir: PathBuf,
    config: &'a Config,
    strict: bool,
    test_runner: Option<&'a dyn TestRunner>,
}

impl<'a> GateEvaluator<'a> {
    pub fn new(root: &'a Path, phase_dir: PathBuf, config: &'a Config) -> Self {
        Self {
            root,
            phase_dir,
            config,
            strict: config.strict,
            test_runner: None,
        }
    }

    /// Evaluator for the state's active phase; `None` when no phase is active.
    pub fn for_active_phase(
        root: &'a Path,
        state: &WorkflowState,
        config: &'a Config,
    ) -> Option<Self> {
        let number = state.active_phase()?;
        let dir = resolve_phase_dir(root, &state.config, number);
        Some(Self::new(root, dir, config))
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = self.strict || strict;
        self
    }

    pub fn with_test_runner(mut self, runner: Option<&'a dyn TestRunner>) -> Self {
        self.test_runner = runner;
        self
    }

    pub fn phase_dir(&self) -> &Path {
        &self.phase_dir
    }

    pub fn evaluate(&self, step: StepName) -> Result<GateReport> {
        let Some(kind) = GateKind::for_step(step) else {
            return Ok(GateReport::new(step, None, Vec::new(), self.strict));
        };
        let gate = Gate::configured(kind, self.config)?;
        let path = self.phase_dir.join(kind.artifact());
        let view = ArtifactView::inspect(&path, &gate.sections);

        let tests = match (kind, self.test_runner) {
            (GateKind::Implement, Some(runner)) if view.is_present() => {
                Some(runner.run(self.root))
            }
            _ => None,
        };

        let findings = gate.check(&view, tests.as_ref());
        let mut report = GateReport::new(step, Some(path), findings, self.strict);
        if matches!(kind, GateKind::Tasks | GateKind::Implement) && view.is_present() {
            report.tally = Some(view.tally);
        }
        report.tests = tests;
        tracing::debug!(%step, verdict = %report.verdict, findings = report.findings.len(), "gate evaluated");
        Ok(report)
    }

    /// All four gates; every one is evaluated even after a failure.
    pub fn evaluate_all(&self) -> Result<GateSummary> {
        let reports = GateKind::all()
            .iter()
            .map(|g| self.evaluate(g.step()))
            .collect::<Result<Vec<_>>>()?;
        let verdict = reports
            .iter()
            .map(|r| r.verdict)
            .max()
            .unwrap_or(Verdict::Pass);
        Ok(GateSummary { verdict, reports })
    }

    /// Recorded status of every step next to the current gate verdict.
    pub fn status(&self, state: &WorkflowState) -> Result<Vec<StepGateStatus>> {
        StepName::all()
            .iter()
            .map(|step| {
                let verdict = match GateKind::for_step(*step) {
                    Some(_) => Some(self.evaluate(*step)?.verdict),
                    None => None,
                };
                Ok(StepGateStatus {
                    step: *step,
                    recorded: state.step_status(*step),
                    verdict,
                })
            })
            .collect()
    }
}

/// The phase's specs directory, or where it would be if it does not exist yet.
pub fn resolve_phase_dir(root: &Path, settings: &PathSettings, number: &str) -> PathBuf {
    settings
        .phase_dir(root, number)
        .unwrap_or_else(|| settings.specs_root(root).join(number))
}

// ---------------------------------------------------------------------------
// Recording
// ---------------------------------------------------------------------------

/// Apply a gate result to the step it guards: a passing verdict completes the
/// step, a failing one marks it failed. Leaving `failed` requires an explicit
/// reset, so re-recording over a failed step is refused by the store.
pub fn record(store: &mut StateStore, report: &GateReport) -> Result<StepStatus> {
    let mut statuses = record_all(store, std::slice::from_ref(report))?;
    Ok(statuses.remove(0))
}

/// Record several gate results in one write. If any step refuses its
/// transition nothing is written.
pub fn record_all(store: &mut StateStore, reports: &[GateReport]) -> Result<Vec<StepStatus>> {
    let root = store.root().to_path_buf();
    let statuses: Vec<StepStatus> = reports.iter().map(recorded_status).collect();
    store.update(|state| {
        for (report, status) in reports.iter().zip(&statuses) {
            apply(state, &root, report, *status);
        }
        Ok(())
    })?;
    for (report, status) in reports.iter().zip(&statuses) {
        tracing::info!(step = %report.step, %status, "gate result recorded");
    }
    Ok(statuses)
}

fn recorded_status(report: &GateReport) -> StepStatus {
    if report.verdict.is_passing() {
        StepStatus::Completed
    } else {
        StepStatus::Failed
    }
}

fn apply(state: &mut WorkflowState, root: &Path, report: &GateReport, status: StepStatus) {
    let entry = state.orchestration.steps.entry(report.step).or_default();
    entry.status = status;
    if let Some(artifact) = &report.artifact {
        let rel = artifact.strip_prefix(root).unwrap_or(artifact);
        let rel = rel.to_string_lossy().to_string();
        if !entry.artifacts.contains(&rel) {
            entry.artifacts.push(rel);
        }
    }
    if let Some(tally) = report.tally {
        entry.set_tally(tally);
        state
            .orchestration
            .steps
            .entry(StepName::Implement)
            .or_default()
            .set_tally(tally);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
