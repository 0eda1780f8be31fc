use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// StepName
// ---------------------------------------------------------------------------

/// The fixed, ordered lifecycle of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Specify,
    Clarify,
    Plan,
    Tasks,
    Analyze,
    Checklist,
    Implement,
    Verify,
}

impl StepName {
    pub fn all() -> &'static [StepName] {
        &[
            StepName::Specify,
            StepName::Clarify,
            StepName::Plan,
            StepName::Tasks,
            StepName::Analyze,
            StepName::Checklist,
            StepName::Implement,
            StepName::Verify,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepName::Specify => "specify",
            StepName::Clarify => "clarify",
            StepName::Plan => "plan",
            StepName::Tasks => "tasks",
            StepName::Analyze => "analyze",
            StepName::Checklist => "checklist",
            StepName::Implement => "implement",
            StepName::Verify => "verify",
        }
    }

    /// Artifact file produced by this step, for the steps that produce one.
    pub fn artifact(self) -> Option<&'static str> {
        match self {
            StepName::Specify => Some(crate::paths::SPEC_MD),
            StepName::Plan => Some(crate::paths::PLAN_MD),
            StepName::Tasks => Some(crate::paths::TASKS_MD),
            _ => None,
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepName {
    type Err = crate::error::SpecflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| crate::error::SpecflowError::UnknownStep(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// StepStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    /// Forward-only transitions available without an explicit reset.
    pub fn can_advance_to(self, to: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress | Completed | Failed) | (InProgress, Completed | Failed)
        ) || self == to
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// InterviewStatus
// ---------------------------------------------------------------------------

/// Declared in order of progress; `Ord` compares how far the interview got.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum InterviewStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
}

impl fmt::Display for InterviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InterviewStatus::NotStarted => "not_started",
            InterviewStatus::InProgress => "in_progress",
            InterviewStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// OrchestrationStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestrationStatus::NotStarted => "not_started",
            OrchestrationStatus::InProgress => "in_progress",
            OrchestrationStatus::Completed => "completed",
            OrchestrationStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// PhaseFormat
// ---------------------------------------------------------------------------

/// Numbering scheme observed in a roadmap table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseFormat {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "2.0")]
    ThreeDigit,
    #[serde(rename = "2.1")]
    FourDigit,
    #[serde(rename = "mixed")]
    Mixed,
}

impl PhaseFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseFormat::None => "none",
            PhaseFormat::ThreeDigit => "2.0",
            PhaseFormat::FourDigit => "2.1",
            PhaseFormat::Mixed => "mixed",
        }
    }
}

impl fmt::Display for PhaseFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TrustMode
// ---------------------------------------------------------------------------

/// Which side reconciliation treats as ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustMode {
    Files,
    State,
}

impl fmt::Display for TrustMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrustMode::Files => "files",
            TrustMode::State => "state",
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn step_order_is_fixed() {
        let names: Vec<&str> = StepName::all().iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            ["specify", "clarify", "plan", "tasks", "analyze", "checklist", "implement", "verify"]
        );
        assert!(StepName::Specify < StepName::Verify);
    }

    #[test]
    fn step_roundtrip() {
        for step in StepName::all() {
            assert_eq!(StepName::from_str(step.as_str()).unwrap(), *step);
        }
        assert!(StepName::from_str("deploy").is_err());
    }

    #[test]
    fn step_artifacts() {
        assert_eq!(StepName::Specify.artifact(), Some("spec.md"));
        assert_eq!(StepName::Tasks.artifact(), Some("tasks.md"));
        assert_eq!(StepName::Verify.artifact(), None);
    }

    #[test]
    fn step_status_transitions() {
        use StepStatus::*;
        assert!(Pending.can_advance_to(InProgress));
        assert!(InProgress.can_advance_to(Completed));
        assert!(InProgress.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Pending));
        assert!(!Completed.can_advance_to(InProgress));
        assert!(!InProgress.can_advance_to(Pending));
        assert!(Failed.can_advance_to(Failed));
    }

    #[test]
    fn interview_progress_ordering() {
        assert!(InterviewStatus::NotStarted < InterviewStatus::InProgress);
        assert!(InterviewStatus::InProgress < InterviewStatus::Completed);
    }

    #[test]
    fn phase_format_serializes_as_version() {
        assert_eq!(serde_json::to_string(&PhaseFormat::FourDigit).unwrap(), "\"2.1\"");
        assert_eq!(serde_json::to_string(&PhaseFormat::ThreeDigit).unwrap(), "\"2.0\"");
        assert_eq!(serde_json::to_string(&PhaseFormat::Mixed).unwrap(), "\"mixed\"");
    }

    #[test]
    fn step_status_json_is_snake_case() {
        assert_eq!(serde_json::to_string(&StepStatus::InProgress).unwrap(), "\"in_progress\"");
    }
}
