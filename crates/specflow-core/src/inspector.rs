//! Read-only structural probes over the artifact store.
//!
//! Every probe is total: a missing or unreadable file yields the "empty"
//! result rather than an error, since absence is the normal state of an
//! in-progress workflow. Callers get a typed [`ArtifactView`] instead of raw
//! text so gate and reconcile logic never re-parse markdown.

use crate::error::{Result, SpecflowError};
use crate::io::read_optional;
use crate::types::PhaseFormat;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Sample matches kept per placeholder pattern. Counts are always exact.
pub const MAX_SAMPLES_PER_PATTERN: usize = 3;

const SAMPLE_TEXT_LIMIT: usize = 120;

// ---------------------------------------------------------------------------
// Static patterns
// ---------------------------------------------------------------------------

static CHECKBOX_RE: OnceLock<Regex> = OnceLock::new();
static TASK_LINE_RE: OnceLock<Regex> = OnceLock::new();
static PHASE_HEADING_RE: OnceLock<Regex> = OnceLock::new();
static TASK_ID_PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();
static TABLE_ROW_RE: OnceLock<Regex> = OnceLock::new();
static PLACEHOLDERS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
static ANGLE_PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

const ANGLE_PLACEHOLDER: &str = r"<<[^<>\n]*>>";
const ELLIPSIS: &str = "...";

fn checkbox_re() -> &'static Regex {
    CHECKBOX_RE.get_or_init(|| Regex::new(r"^\s*-\s*\[([x ])\]").unwrap())
}

fn task_line_re() -> &'static Regex {
    TASK_LINE_RE.get_or_init(|| Regex::new(r"^\s*-\s*\[[x ]\]\s*T[0-9]+").unwrap())
}

fn phase_heading_re() -> &'static Regex {
    PHASE_HEADING_RE.get_or_init(|| Regex::new(r"^## Phase").unwrap())
}

fn task_id_placeholder_re() -> &'static Regex {
    TASK_ID_PLACEHOLDER_RE.get_or_init(|| Regex::new(r"\bTXXX\b").unwrap())
}

fn table_row_re() -> &'static Regex {
    TABLE_ROW_RE.get_or_init(|| Regex::new(r"^\s*\|\s*(\d{3,4})\s*\|").unwrap())
}

fn placeholder_patterns() -> &'static [(&'static str, Regex)] {
    PLACEHOLDERS.get_or_init(|| {
        [
            ("[PLACEHOLDER]", r"(?i)\[placeholder\]"),
            ("[TBD]", r"(?i)\[tbd\]"),
            ("[TODO]", r"(?i)\[todo\]"),
            ("[FILL IN]", r"(?i)\[fill in\]"),
            ("[INSERT]", r"(?i)\[insert\]"),
            ("[DESCRIBE]", r"(?i)\[describe\]"),
            ("[ADD]", r"(?i)\[add\]"),
            ("<<...>>", ANGLE_PLACEHOLDER),
            (ELLIPSIS, r"\.\.\."),
        ]
        .into_iter()
        .map(|(token, pat)| (token, Regex::new(pat).unwrap()))
        .collect()
    })
}

fn angle_placeholder_re() -> &'static Regex {
    ANGLE_PLACEHOLDER_RE.get_or_init(|| Regex::new(ANGLE_PLACEHOLDER).unwrap())
}

/// Phase number in the first column of a markdown table row, if any.
pub fn table_row_number(line: &str) -> Option<&str> {
    table_row_re()
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

// ---------------------------------------------------------------------------
// SectionCheck
// ---------------------------------------------------------------------------

/// A named section and the line pattern that proves it is present.
///
/// Matching is case-sensitive and anchored at line start after optional
/// leading whitespace; a pattern without a leading `^` is anchored implicitly.
#[derive(Debug, Clone)]
pub struct SectionCheck {
    pub name: String,
    source: String,
    regex: Regex,
}

impl SectionCheck {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self> {
        let anchored = if pattern.starts_with('^') {
            pattern.to_string()
        } else {
            format!("^(?:{pattern})")
        };
        let regex = Regex::new(&anchored).map_err(|e| SpecflowError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            name: name.into(),
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.source
    }

    fn matches(&self, line: &str) -> bool {
        self.regex.is_match(line.trim_start())
    }
}

// ---------------------------------------------------------------------------
// Probe results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderMatch {
    pub token: String,
    /// 1-indexed line number.
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderScan {
    /// Exact occurrence count per token; tokens with zero matches are absent.
    pub counts: BTreeMap<String, usize>,
    /// Up to [`MAX_SAMPLES_PER_PATTERN`] matches per token, in file order.
    pub samples: Vec<PlaceholderMatch>,
}

impl PlaceholderScan {
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn samples_for<'a>(&'a self, token: &'a str) -> impl Iterator<Item = &'a PlaceholderMatch> {
        self.samples.iter().filter(move |m| m.token == token)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTally {
    pub completed: u32,
    pub total: u32,
}

impl TaskTally {
    pub fn new(completed: u32, total: u32) -> Self {
        Self { completed, total }
    }

    pub fn incomplete(&self) -> u32 {
        self.total.saturating_sub(self.completed)
    }
}

impl fmt::Display for TaskTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.completed, self.total)
    }
}

// ---------------------------------------------------------------------------
// ArtifactView
// ---------------------------------------------------------------------------

/// Everything the engine needs to know about one artifact, gathered in a
/// single read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactView {
    pub path: PathBuf,
    pub exists: bool,
    pub non_empty: bool,
    pub sections: BTreeMap<String, bool>,
    pub placeholders: PlaceholderScan,
    pub tally: TaskTally,
    pub phase_headings: usize,
    pub task_lines: usize,
    pub placeholder_task_ids: usize,
}

impl ArtifactView {
    pub fn inspect(path: &Path, sections: &[SectionCheck]) -> Self {
        let text = read_optional(path);
        Self::from_text(path, text.as_deref(), sections)
    }

    pub fn from_text(path: &Path, text: Option<&str>, sections: &[SectionCheck]) -> Self {
        let body = text.unwrap_or("");
        let mut phase_headings = 0;
        let mut task_lines = 0;
        let mut placeholder_task_ids = 0;
        for line in body.lines() {
            if phase_heading_re().is_match(line) {
                phase_headings += 1;
            }
            if task_line_re().is_match(line) {
                task_lines += 1;
            }
            if task_id_placeholder_re().is_match(line) {
                placeholder_task_ids += 1;
            }
        }
        Self {
            path: path.to_path_buf(),
            exists: text.is_some(),
            non_empty: !body.trim().is_empty(),
            sections: sections_in(body, sections),
            placeholders: placeholders_in(body),
            tally: checkboxes_in(body),
            phase_headings,
            task_lines,
            placeholder_task_ids,
        }
    }

    /// True when the artifact can be inspected at all.
    pub fn is_present(&self) -> bool {
        self.exists && self.non_empty
    }

    pub fn missing_sections(&self) -> impl Iterator<Item = &str> {
        self.sections
            .iter()
            .filter(|(_, present)| !**present)
            .map(|(name, _)| name.as_str())
    }
}

// ---------------------------------------------------------------------------
// Path-level probes
// ---------------------------------------------------------------------------

pub fn file_exists(path: &Path) -> bool {
    path.is_file()
}

pub fn is_non_empty(path: &Path) -> bool {
    read_optional(path).is_some_and(|t| !t.trim().is_empty())
}

pub fn find_sections(path: &Path, checks: &[SectionCheck]) -> BTreeMap<String, bool> {
    sections_in(read_optional(path).as_deref().unwrap_or(""), checks)
}

pub fn find_placeholders(path: &Path) -> PlaceholderScan {
    placeholders_in(read_optional(path).as_deref().unwrap_or(""))
}

pub fn count_checkboxes(path: &Path) -> TaskTally {
    checkboxes_in(read_optional(path).as_deref().unwrap_or(""))
}

pub fn detect_phase_format(roadmap: &Path) -> PhaseFormat {
    phase_format_in(read_optional(roadmap).as_deref().unwrap_or(""))
}

// ---------------------------------------------------------------------------
// Text-level probes
// ---------------------------------------------------------------------------

fn sections_in(text: &str, checks: &[SectionCheck]) -> BTreeMap<String, bool> {
    checks
        .iter()
        .map(|check| {
            let present = text.lines().any(|line| check.matches(line));
            (check.name.clone(), present)
        })
        .collect()
}

fn placeholders_in(text: &str) -> PlaceholderScan {
    let mut scan = PlaceholderScan::default();
    for (token, regex) in placeholder_patterns() {
        let mut count = 0;
        for (idx, line) in text.lines().enumerate() {
            // `<<...>>` is its own token; its dots are not an ellipsis.
            let haystack = if *token == ELLIPSIS {
                angle_placeholder_re().replace_all(line, " ")
            } else {
                Cow::Borrowed(line)
            };
            let hits = regex.find_iter(&haystack).count();
            if hits == 0 {
                continue;
            }
            if count < MAX_SAMPLES_PER_PATTERN {
                scan.samples.push(PlaceholderMatch {
                    token: token.to_string(),
                    line: idx + 1,
                    text: line.trim().chars().take(SAMPLE_TEXT_LIMIT).collect(),
                });
            }
            count += hits;
        }
        if count > 0 {
            scan.counts.insert(token.to_string(), count);
        }
    }
    scan
}

fn checkboxes_in(text: &str) -> TaskTally {
    let mut tally = TaskTally::default();
    for line in text.lines() {
        if let Some(caps) = checkbox_re().captures(line) {
            tally.total += 1;
            if caps.get(1).is_some_and(|m| m.as_str() != " ") {
                tally.completed += 1;
            }
        }
    }
    tally
}

pub(crate) fn phase_format_in(text: &str) -> PhaseFormat {
    let mut three = false;
    let mut four = false;
    for number in text.lines().filter_map(table_row_number) {
        match number.len() {
            3 => three = true,
            _ => four = true,
        }
    }
    match (three, four) {
        (false, false) => PhaseFormat::None,
        (true, false) => PhaseFormat::ThreeDigit,
        (false, true) => PhaseFormat::FourDigit,
        (true, true) => PhaseFormat::Mixed,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let p = dir.path().join(name);
        std::fs::write(&p, content).unwrap();
        p
    }

    #[test]
    fn checkbox_counts_exact() {
        let dir = TempDir::new().unwrap();
        let p = write(
            &dir,
            "tasks.md",
            "# Tasks\n\n- [x] T001 one\nnoise line\n- [ ] T002 two\n  - [x] T003 nested\n* [x] not a dash\n- [x] T004\n",
        );
        assert_eq!(count_checkboxes(&p), TaskTally::new(3, 4));
    }

    #[test]
    fn checkbox_counts_zero_and_one() {
        let dir = TempDir::new().unwrap();
        let none = write(&dir, "none.md", "# nothing here\n- plain bullet\n");
        assert_eq!(count_checkboxes(&none), TaskTally::new(0, 0));
        let one = write(&dir, "one.md", "- [ ] T001 only\n");
        assert_eq!(count_checkboxes(&one), TaskTally::new(0, 1));
    }

    #[test]
    fn checkbox_missing_file_is_zero() {
        let dir = TempDir::new().unwrap();
        assert_eq!(count_checkboxes(&dir.path().join("nope.md")), TaskTally::default());
    }

    #[test]
    fn sections_anchor_after_whitespace() {
        let dir = TempDir::new().unwrap();
        let p = write(&dir, "spec.md", "# Spec\n   ## Overview\nSee ## Requirements inline\n");
        let checks = vec![
            SectionCheck::new("Overview", "^## Overview").unwrap(),
            SectionCheck::new("Requirements", "## Requirements").unwrap(),
        ];
        let found = find_sections(&p, &checks);
        assert_eq!(found["Overview"], true);
        assert_eq!(found["Requirements"], false);
    }

    #[test]
    fn sections_are_case_sensitive() {
        let checks = vec![SectionCheck::new("Overview", "^## Overview").unwrap()];
        let view = ArtifactView::from_text(Path::new("spec.md"), Some("## overview\n"), &checks);
        assert_eq!(view.missing_sections().collect::<Vec<_>>(), vec!["Overview"]);
    }

    #[test]
    fn invalid_section_pattern_rejected() {
        assert!(matches!(
            SectionCheck::new("bad", "^## (unclosed"),
            Err(SpecflowError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn placeholders_counted_exactly_with_capped_samples() {
        let text = "[TBD] a\n[tbd] b\n[TBD] c [TBD]\n[TBD] e\n<<name>>\n";
        let scan = placeholders_in(text);
        assert_eq!(scan.counts["[TBD]"], 5);
        assert_eq!(scan.counts["<<...>>"], 1);
        assert_eq!(scan.samples_for("[TBD]").count(), MAX_SAMPLES_PER_PATTERN);
        assert_eq!(scan.total(), 6);
    }

    #[test]
    fn ellipsis_counts_anywhere_but_not_inside_angle_placeholder() {
        let text = "- [ ] T001 Configure auth, logging, ...\n| ... |\n<<...>> and <<name>>\n";
        let scan = placeholders_in(text);
        assert_eq!(scan.counts.get("..."), Some(&2));
        assert_eq!(scan.counts.get("<<...>>"), Some(&2));
    }

    #[test]
    fn uppercase_checkbox_is_not_a_checkbox() {
        assert_eq!(checkboxes_in("- [X] T001 a\n- [ ] T002 b\n"), TaskTally::new(0, 1));
        assert_eq!(task_line_re().find_iter("- [X] T001 a").count(), 0);
    }

    #[test]
    fn placeholder_free_text_is_empty() {
        let dir = TempDir::new().unwrap();
        let p = write(&dir, "plan.md", "# Plan\n\n## Technical Context\nRust 1.80\n");
        assert!(find_placeholders(&p).is_empty());
    }

    #[test]
    fn view_of_missing_file() {
        let view = ArtifactView::inspect(Path::new("/nonexistent/tasks.md"), &[]);
        assert!(!view.exists);
        assert!(!view.is_present());
        assert_eq!(view.tally, TaskTally::default());
    }

    #[test]
    fn view_counts_task_structure() {
        let text = "## Phase 1: Setup\n- [ ] T001 Init\n- [x] T002 Configure\n- [ ] TXXX later\n## Notes\n";
        let view = ArtifactView::from_text(Path::new("tasks.md"), Some(text), &[]);
        assert_eq!(view.phase_headings, 1);
        assert_eq!(view.task_lines, 2);
        assert_eq!(view.placeholder_task_ids, 1);
        assert_eq!(view.tally, TaskTally::new(1, 3));
    }

    #[test]
    fn whitespace_only_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let p = write(&dir, "spec.md", "  \n\n");
        assert!(file_exists(&p));
        assert!(!is_non_empty(&p));
    }

    #[test]
    fn phase_format_detection() {
        assert_eq!(phase_format_in(""), PhaseFormat::None);
        assert_eq!(phase_format_in("| Phase | Name |\n|---|---|\n"), PhaseFormat::None);
        assert_eq!(
            phase_format_in("| 001 | Core | Done |\n| 002 | API | |\n"),
            PhaseFormat::ThreeDigit
        );
        assert_eq!(phase_format_in("| 0010 | Core | Done |\n"), PhaseFormat::FourDigit);
        assert_eq!(
            phase_format_in("| 0010 | Core |\n| 002 | API |\n"),
            PhaseFormat::Mixed
        );
    }

    #[test]
    fn phase_format_of_missing_roadmap_is_none() {
        assert_eq!(detect_phase_format(Path::new("/nonexistent/ROADMAP.md")), PhaseFormat::None);
    }

    #[test]
    fn table_row_number_ignores_five_digits() {
        assert_eq!(table_row_number("| 0010 | x |"), Some("0010"));
        assert_eq!(table_row_number("  |042| x |"), Some("042"));
        assert_eq!(table_row_number("| 00100 | x |"), None);
        assert_eq!(table_row_number("0010 | x |"), None);
    }
}
