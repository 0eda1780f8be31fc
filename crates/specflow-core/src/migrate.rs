//! Three-digit to four-digit phase renumbering, fuzzy phase lookup, and
//! archival of completed phases.
//!
//! Renumbering multiplies by ten (`042` becomes `0420`) so a sub-phase can be
//! slotted between two existing phases later without touching either.
//! Every multi-file edit goes through a [`Journal`] so a failure part-way
//! through restores every file already touched.

use crate::error::{Result, SpecflowError};
use crate::inspector::phase_format_in;
use crate::io::{atomic_write, read_optional};
use crate::paths::PathSettings;
use crate::roadmap::{self, PhaseStatus, Roadmap};
use crate::state::StateStore;
use crate::types::PhaseFormat;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static LEGACY_ROW_RE: OnceLock<Regex> = OnceLock::new();
static LEGACY_HEADING_RE: OnceLock<Regex> = OnceLock::new();
static LEGACY_NAME_RE: OnceLock<Regex> = OnceLock::new();
static FUZZY_RE: OnceLock<Regex> = OnceLock::new();

fn legacy_row_re() -> &'static Regex {
    LEGACY_ROW_RE.get_or_init(|| Regex::new(r"^(\s*\|\s*)(\d{3})(\s*\|)").unwrap())
}

fn legacy_heading_re() -> &'static Regex {
    LEGACY_HEADING_RE.get_or_init(|| Regex::new(r"^(###\s+)(\d{3})\b").unwrap())
}

/// File or directory name led by a three-digit number.
fn legacy_name_re() -> &'static Regex {
    LEGACY_NAME_RE.get_or_init(|| Regex::new(r"^(\d{3})([-.].*)?$").unwrap())
}

fn fuzzy_re() -> &'static Regex {
    FUZZY_RE.get_or_init(|| Regex::new(r"^\d{1,4}$").unwrap())
}

/// `"042"` → `"0420"`.
pub fn expand_legacy(number: &str) -> Result<String> {
    if number.len() != 3 || !number.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SpecflowError::InvalidPhaseNumber(number.to_string()));
    }
    let value: u32 = number
        .parse()
        .map_err(|_| SpecflowError::InvalidPhaseNumber(number.to_string()))?;
    Ok(format!("{:04}", value * 10))
}

/// Resolve loosely typed operator input (`"1"`, `"42"`, `"0420"`) against the
/// known phase numbers.
///
/// The exact four-digit form is tried first; values below 1000 then try the
/// ×10 expansion and finally a legacy three-digit match. Returns `None` when
/// nothing matches rather than guessing.
pub fn normalize_fuzzy(input: &str, known: &[String]) -> Result<Option<String>> {
    let input = input.trim();
    if !fuzzy_re().is_match(input) {
        return Err(SpecflowError::InvalidPhaseNumber(input.to_string()));
    }
    let value: u32 = input
        .parse()
        .map_err(|_| SpecflowError::InvalidPhaseNumber(input.to_string()))?;
    let has = |candidate: &str| known.iter().any(|k| k == candidate);

    let exact = format!("{value:04}");
    if has(&exact) {
        return Ok(Some(exact));
    }
    if value < 1000 {
        let expanded = format!("{:04}", value * 10);
        if has(&expanded) {
            return Ok(Some(expanded));
        }
        let legacy = format!("{value:03}");
        if has(&legacy) {
            return Ok(Some(legacy));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

enum Undo {
    Restore { path: PathBuf, original: Vec<u8> },
    Remove(PathBuf),
    Rename { from: PathBuf, to: PathBuf },
}

/// Records how to reverse each filesystem edit, newest last.
#[derive(Default)]
struct Journal {
    undo: Vec<Undo>,
}

impl Journal {
    fn write(&mut self, path: &Path, data: &[u8]) -> Result<()> {
        let undo = match std::fs::read(path) {
            Ok(original) => Undo::Restore {
                path: path.to_path_buf(),
                original,
            },
            Err(_) => Undo::Remove(path.to_path_buf()),
        };
        atomic_write(path, data)?;
        self.undo.push(undo);
        Ok(())
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to)?;
        self.undo.push(Undo::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        });
        Ok(())
    }

    fn remove_file(&mut self, path: &Path) -> Result<()> {
        let original = std::fs::read(path)?;
        std::fs::remove_file(path)?;
        self.undo.push(Undo::Restore {
            path: path.to_path_buf(),
            original,
        });
        Ok(())
    }

    /// Reverse every recorded edit. Failures are logged and skipped so as
    /// much as possible is restored.
    fn rollback(self) {
        for undo in self.undo.into_iter().rev() {
            let result = match &undo {
                Undo::Restore { path, original } => atomic_write(path, original),
                Undo::Remove(path) => std::fs::remove_file(path).map_err(Into::into),
                Undo::Rename { from, to } => std::fs::rename(to, from).map_err(Into::into),
            };
            if let Err(e) = result {
                tracing::error!(error = %e, "rollback step failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Renumbered {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamedPath {
    pub from: PathBuf,
    pub to: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub field: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub dry_run: bool,
    pub format_before: PhaseFormat,
    pub format_after: PhaseFormat,
    pub renumbered: Vec<Renumbered>,
    /// Roadmap lines rewritten (table rows and inline headings).
    pub roadmap_lines: usize,
    pub renamed: Vec<RenamedPath>,
    pub state: Vec<StateChange>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.roadmap_lines == 0 && self.renamed.is_empty() && self.state.is_empty()
    }
}

/// Rewrite `042`-style identifiers as `0420` across the roadmap, the phases
/// directory, the specs directories and the state document.
///
/// A roadmap mixing both widths is refused. On failure every edit already
/// made is reversed and [`SpecflowError::MigrationRolledBack`] is returned.
pub fn migrate(store: &mut StateStore, dry_run: bool) -> Result<MigrationReport> {
    let root = store.root().to_path_buf();
    let settings = store.state().config.clone();
    let roadmap = Roadmap::load(&settings.roadmap_path(&root));
    let format_before = roadmap.format();
    if format_before == PhaseFormat::Mixed {
        return Err(SpecflowError::AmbiguousInput(format!(
            "{} mixes 3- and 4-digit phase numbers; convert the remaining rows by hand",
            settings.roadmap
        )));
    }

    let (new_text, roadmap_lines, mut renumbered) = rewrite_roadmap(&roadmap.text)?;
    let renamed = plan_renames(&root, &settings)?;
    for rename in &renamed {
        if rename.to.exists() {
            return Err(SpecflowError::AmbiguousInput(format!(
                "cannot rename {}: {} already exists",
                rename.from.display(),
                rename.to.display()
            )));
        }
    }
    let state = plan_state_changes(store)?;
    for change in state.iter().filter(|c| c.field == "orchestration.phaseNumber") {
        push_unique(&mut renumbered, &change.from, &change.to);
    }

    let report = MigrationReport {
        dry_run,
        format_before,
        format_after: if roadmap_lines > 0 {
            phase_format_in(&new_text)
        } else {
            format_before
        },
        renumbered,
        roadmap_lines,
        renamed,
        state,
    };
    if dry_run || report.is_noop() {
        return Ok(report);
    }

    let mut journal = Journal::default();
    if let Err(e) = apply(store, &mut journal, &roadmap, &new_text, &report) {
        tracing::error!(error = %e, "migration failed; rolling back");
        journal.rollback();
        return Err(SpecflowError::MigrationRolledBack(e.to_string()));
    }
    tracing::info!(
        phases = report.renumbered.len(),
        renamed = report.renamed.len(),
        "phase numbering migrated"
    );
    Ok(report)
}

fn apply(
    store: &mut StateStore,
    journal: &mut Journal,
    roadmap: &Roadmap,
    new_text: &str,
    report: &MigrationReport,
) -> Result<()> {
    if report.roadmap_lines > 0 {
        journal.write(&roadmap.path, new_text.as_bytes())?;
    }
    for rename in &report.renamed {
        journal.rename(&rename.from, &rename.to)?;
    }
    if report.state.is_empty() {
        return Ok(());
    }
    store.update(|state| {
        for change in &report.state {
            match change.field.as_str() {
                "orchestration.phaseNumber" => {
                    state.orchestration.phase_number = Some(change.to.clone())
                }
                "orchestration.branch" => state.orchestration.branch = Some(change.to.clone()),
                _ => {}
            }
        }
        Ok(())
    })
}

fn push_unique(list: &mut Vec<Renumbered>, from: &str, to: &str) {
    if !list.iter().any(|r| r.from == from) {
        list.push(Renumbered {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
}

/// Returns the rewritten text, the number of lines changed, and each distinct
/// renumbering in document order. Trailing newline state is preserved.
fn rewrite_roadmap(text: &str) -> Result<(String, usize, Vec<Renumbered>)> {
    let mut out = Vec::new();
    let mut changed = 0;
    let mut renumbered = Vec::new();
    for line in text.lines() {
        let caps = legacy_row_re()
            .captures(line)
            .or_else(|| legacy_heading_re().captures(line));
        let Some(caps) = caps else {
            out.push(line.to_string());
            continue;
        };
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        let old = &caps[2];
        let new = expand_legacy(old)?;
        let suffix = caps.get(3).map_or("", |m| m.as_str());
        out.push(format!("{}{}{}{}", &caps[1], new, suffix, &line[whole.end..]));
        push_unique(&mut renumbered, old, &new);
        changed += 1;
    }
    let mut new_text = out.join("\n");
    if text.ends_with('\n') {
        new_text.push('\n');
    }
    Ok((new_text, changed, renumbered))
}

fn plan_renames(root: &Path, settings: &PathSettings) -> Result<Vec<RenamedPath>> {
    let mut renames = Vec::new();
    for dir in [settings.phases_dir(root), settings.specs_root(root)] {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();
        for name in names {
            let Some(caps) = legacy_name_re().captures(&name) else {
                continue;
            };
            let new = expand_legacy(&caps[1])?;
            let rest = caps.get(2).map_or("", |m| m.as_str());
            renames.push(RenamedPath {
                from: dir.join(&name),
                to: dir.join(format!("{new}{rest}")),
            });
        }
    }
    Ok(renames)
}

fn plan_state_changes(store: &StateStore) -> Result<Vec<StateChange>> {
    let orch = &store.state().orchestration;
    let mut changes = Vec::new();
    let Some(number) = orch.phase_number.as_deref().filter(|n| n.len() == 3) else {
        return Ok(changes);
    };
    let new = expand_legacy(number)?;
    changes.push(StateChange {
        field: "orchestration.phaseNumber".to_string(),
        from: number.to_string(),
        to: new.clone(),
    });
    if let Some(branch) = orch.branch.as_deref() {
        if let Some(caps) = legacy_name_re().captures(branch).filter(|c| &c[1] == number) {
            let rest = caps.get(2).map_or("", |m| m.as_str());
            changes.push(StateChange {
                field: "orchestration.branch".to_string(),
                from: branch.to_string(),
                to: format!("{new}{rest}"),
            });
        }
    }
    Ok(changes)
}

// ---------------------------------------------------------------------------
// Archival
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveReport {
    pub number: String,
    pub name: String,
    pub history: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_file: Option<PathBuf>,
    pub removed_inline_section: bool,
}

fn history_heading_re(number: &str) -> Regex {
    Regex::new(&format!(r"(?m)^##\s+{}\b", regex::escape(number))).expect("escaped pattern")
}

/// Move a completed phase's record into the history document.
///
/// The history gains one `## NNNN - Name` entry carrying the phase body;
/// the phase file and any inline roadmap section are removed. The roadmap
/// table row stays as the index. Archiving twice, or archiving a phase that
/// is not completed, is refused.
pub fn archive_phase(root: &Path, settings: &PathSettings, number: &str) -> Result<ArchiveReport> {
    let record = roadmap::lookup(root, settings, number)
        .ok_or_else(|| SpecflowError::PhaseNotFound(number.to_string()))?;
    let history_path = settings.history_path(root);
    let history = read_optional(&history_path).unwrap_or_default();
    if history_heading_re(number).is_match(&history) {
        return Err(SpecflowError::AlreadyArchived(number.to_string()));
    }
    if record.status != PhaseStatus::Completed {
        return Err(SpecflowError::InvalidTransition {
            from: record.status.to_string(),
            to: "archived".to_string(),
            reason: format!("phase {number} must be completed before it is archived"),
        });
    }

    let roadmap = Roadmap::load(&settings.roadmap_path(root));
    let span = roadmap.inline_section_span(number);
    let lines: Vec<&str> = roadmap.text.lines().collect();

    let body = match (&record.path, span) {
        (Some(path), _) => read_optional(path).unwrap_or_default(),
        (None, Some((start, end))) => lines[start + 1..end].join("\n"),
        (None, None) => String::new(),
    };

    let mut entry = String::new();
    if history.trim().is_empty() {
        entry.push_str("# History\n");
    } else if !history.ends_with('\n') {
        entry.push('\n');
    }
    entry.push_str(&format!(
        "\n## {number} - {}\n\n**Archived**: {}\n",
        record.name,
        Utc::now().format("%Y-%m-%d")
    ));
    let body = body.trim();
    if !body.is_empty() {
        entry.push('\n');
        entry.push_str(body);
        entry.push('\n');
    }

    let mut journal = Journal::default();
    let result = (|| -> Result<()> {
        journal.write(&history_path, format!("{history}{entry}").as_bytes())?;
        if let Some(path) = &record.path {
            journal.remove_file(path)?;
        }
        if let Some((start, end)) = span {
            let mut kept: Vec<&str> = lines[..start].to_vec();
            kept.extend_from_slice(&lines[end..]);
            let mut text = kept.join("\n");
            if roadmap.text.ends_with('\n') {
                text.push('\n');
            }
            journal.write(&roadmap.path, text.as_bytes())?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        journal.rollback();
        return Err(e);
    }

    tracing::info!(phase = number, history = %history_path.display(), "phase archived");
    Ok(ArchiveReport {
        number: number.to_string(),
        name: record.name,
        history: history_path,
        removed_file: record.path,
        removed_inline_section: span.is_some(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
