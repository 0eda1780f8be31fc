//! Phase records from the roadmap table, inline `### NNNN - Name` sections and
//! per-phase files under the phases directory.

use crate::inspector::{phase_format_in, table_row_number};
use crate::io::read_optional;
use crate::paths::PathSettings;
use crate::types::PhaseFormat;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static INLINE_HEADING_RE: OnceLock<Regex> = OnceLock::new();
static STATUS_LINE_RE: OnceLock<Regex> = OnceLock::new();
static PHASE_FILE_RE: OnceLock<Regex> = OnceLock::new();

fn inline_heading_re() -> &'static Regex {
    INLINE_HEADING_RE
        .get_or_init(|| Regex::new(r"^###\s+(\d{3,4})\b\s*(?:[-:\u{2013}\u{2014}]\s*)?(.*?)\s*$").unwrap())
}

fn status_line_re() -> &'static Regex {
    STATUS_LINE_RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:[-*]\s*)?\**status\**\s*:\s*\**\s*(.*?)\s*$").unwrap()
    })
}

fn phase_file_re() -> &'static Regex {
    PHASE_FILE_RE.get_or_init(|| Regex::new(r"^(\d{3,4})(?:-(.*))?\.md$").unwrap())
}

// ---------------------------------------------------------------------------
// PhaseStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Blocked,
    Deferred,
}

impl PhaseStatus {
    /// Read a free-form status cell such as `✅ Complete` or `**In Progress**`.
    pub fn parse(raw: &str) -> PhaseStatus {
        let s = raw.to_lowercase();
        if s.contains("not started") || s.contains("incomplete") || s.contains("pending") {
            PhaseStatus::NotStarted
        } else if s.contains("progress") || s.contains("active") || s.contains('🔄') {
            PhaseStatus::InProgress
        } else if s.contains('✅') || s.contains("complete") || s.contains("done") {
            PhaseStatus::Completed
        } else if s.contains("block") {
            PhaseStatus::Blocked
        } else if s.contains("defer") || s.contains("skip") {
            PhaseStatus::Deferred
        } else {
            PhaseStatus::NotStarted
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseStatus::NotStarted => "not_started",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Blocked => "blocked",
            PhaseStatus::Deferred => "deferred",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// PhaseRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseSource {
    Table,
    Inline,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub number: String,
    pub name: String,
    pub status: PhaseStatus,
    pub source: PhaseSource,
    /// 1-indexed roadmap line for table rows and inline sections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Roadmap
// ---------------------------------------------------------------------------

/// A loaded roadmap document. An absent file behaves as an empty one.
#[derive(Debug, Clone)]
pub struct Roadmap {
    pub path: PathBuf,
    pub text: String,
    pub exists: bool,
}

impl Roadmap {
    pub fn load(path: &Path) -> Self {
        let text = read_optional(path);
        Self {
            path: path.to_path_buf(),
            exists: text.is_some(),
            text: text.unwrap_or_default(),
        }
    }

    pub fn format(&self) -> PhaseFormat {
        phase_format_in(&self.text)
    }

    /// Table rows in document order. Column positions come from the nearest
    /// header row (`Name`/`Status` cells), falling back to columns 2 and 3.
    pub fn rows(&self) -> Vec<PhaseRecord> {
        let mut rows = Vec::new();
        let mut name_col = 1;
        let mut status_col = 2;
        for (idx, line) in self.text.lines().enumerate() {
            let trimmed = line.trim();
            if !trimmed.starts_with('|') {
                continue;
            }
            let cells = split_cells(trimmed);
            let Some(number) = table_row_number(line) else {
                if let Some((n, s)) = header_columns(&cells) {
                    name_col = n;
                    status_col = s;
                }
                continue;
            };
            rows.push(PhaseRecord {
                number: number.to_string(),
                name: cells.get(name_col).map(|c| clean_cell(c)).unwrap_or_default(),
                status: cells
                    .get(status_col)
                    .map(|c| PhaseStatus::parse(c))
                    .unwrap_or_default(),
                source: PhaseSource::Table,
                line: Some(idx + 1),
                path: None,
            });
        }
        rows
    }

    /// `### NNNN - Name` sections. Status comes from a `**Status**:` line in
    /// the section body, if any.
    pub fn inline_sections(&self) -> Vec<PhaseRecord> {
        let lines: Vec<&str> = self.text.lines().collect();
        let mut sections = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            let Some(caps) = inline_heading_re().captures(line) else {
                continue;
            };
            let body_end = section_end(&lines, idx);
            let status = lines[idx + 1..body_end]
                .iter()
                .find_map(|l| status_line_re().captures(l))
                .map(|c| PhaseStatus::parse(&c[1]))
                .unwrap_or_default();
            sections.push(PhaseRecord {
                number: caps[1].to_string(),
                name: caps[2].to_string(),
                status,
                source: PhaseSource::Inline,
                line: Some(idx + 1),
                path: None,
            });
        }
        sections
    }

    /// Line range `[start, end)` (0-indexed) of the inline section for
    /// `number`, heading included.
    pub fn inline_section_span(&self, number: &str) -> Option<(usize, usize)> {
        let lines: Vec<&str> = self.text.lines().collect();
        let start = lines.iter().position(|l| {
            inline_heading_re()
                .captures(l)
                .is_some_and(|c| &c[1] == number)
        })?;
        Some((start, section_end(&lines, start)))
    }

    pub fn row(&self, number: &str) -> Option<PhaseRecord> {
        self.rows().into_iter().find(|r| r.number == number)
    }
}

/// Index of the first line after `start` that opens a heading of level 3 or
/// shallower.
fn section_end(lines: &[&str], start: usize) -> usize {
    lines[start + 1..]
        .iter()
        .position(|l| {
            let t = l.trim_start();
            t.starts_with("# ") || t.starts_with("## ") || t.starts_with("### ")
        })
        .map(|offset| start + 1 + offset)
        .unwrap_or(lines.len())
}

fn split_cells(line: &str) -> Vec<&str> {
    line.trim_matches('|').split('|').map(str::trim).collect()
}

fn clean_cell(cell: &str) -> String {
    cell.trim_matches(|c: char| c == '*' || c == '_' || c == '`' || c.is_whitespace())
        .to_string()
}

fn header_columns(cells: &[&str]) -> Option<(usize, usize)> {
    let lower: Vec<String> = cells.iter().map(|c| clean_cell(c).to_lowercase()).collect();
    let status = lower.iter().position(|c| c == "status")?;
    let name = lower
        .iter()
        .position(|c| c == "name" || c == "title" || c == "phase name")
        .unwrap_or(1);
    Some((name, status))
}

// ---------------------------------------------------------------------------
// Phase files
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct PhaseFrontmatter {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

fn extract_frontmatter(content: &str) -> Option<&str> {
    let rest = content.strip_prefix("---\n")?;
    let end = rest.find("\n---")?;
    Some(&rest[..end])
}

/// Every `NNNN-name.md` in the phases directory, sorted by file name.
pub fn phase_files(root: &Path, settings: &PathSettings) -> Vec<PhaseRecord> {
    let dir = settings.phases_dir(root);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    paths
        .into_iter()
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?.to_string();
            let caps = phase_file_re().captures(&file_name)?;
            let number = caps[1].to_string();
            let slug = caps.get(2).map(|m| m.as_str().replace('-', " ")).unwrap_or_default();
            let (status, name) = phase_file_status(&path);
            Some(PhaseRecord {
                number,
                name: name.unwrap_or(slug),
                status,
                source: PhaseSource::File,
                line: None,
                path: Some(path),
            })
        })
        .collect()
}

fn phase_file_status(path: &Path) -> (PhaseStatus, Option<String>) {
    let Some(content) = read_optional(path) else {
        return (PhaseStatus::default(), None);
    };
    if let Some(fm) = extract_frontmatter(&content) {
        match serde_yaml::from_str::<PhaseFrontmatter>(fm) {
            Ok(meta) => {
                if let Some(status) = meta.status {
                    return (PhaseStatus::parse(&status), meta.name);
                }
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "bad phase file frontmatter"),
        }
    }
    let status = content
        .lines()
        .find_map(|l| status_line_re().captures(l))
        .map(|c| PhaseStatus::parse(&c[1]))
        .unwrap_or_default();
    (status, None)
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Resolve one phase. A dedicated phase file wins over an inline section,
/// which wins over the bare table row.
pub fn lookup(root: &Path, settings: &PathSettings, number: &str) -> Option<PhaseRecord> {
    if let Some(file) = phase_files(root, settings)
        .into_iter()
        .find(|p| p.number == number)
    {
        return Some(file);
    }
    let roadmap = Roadmap::load(&settings.roadmap_path(root));
    let inline = roadmap
        .inline_sections()
        .into_iter()
        .find(|p| p.number == number);
    match (inline, roadmap.row(number)) {
        (Some(mut section), Some(row)) => {
            if section.status == PhaseStatus::NotStarted {
                section.status = row.status;
            }
            Some(section)
        }
        (Some(section), None) => Some(section),
        (None, row) => row,
    }
}

/// Every phase number known to the roadmap or the phases directory, sorted
/// and de-duplicated.
pub fn known_numbers(root: &Path, settings: &PathSettings) -> Vec<String> {
    let roadmap = Roadmap::load(&settings.roadmap_path(root));
    let mut numbers: Vec<String> = roadmap
        .rows()
        .into_iter()
        .chain(roadmap.inline_sections())
        .chain(phase_files(root, settings))
        .map(|p| p.number)
        .collect();
    numbers.sort();
    numbers.dedup();
    numbers
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConflict {
    pub number: String,
    pub inline_line: usize,
    pub file: PathBuf,
}

/// Phases stored both inline in the roadmap and in a phase file.
pub fn storage_conflicts(root: &Path, settings: &PathSettings) -> Vec<StorageConflict> {
    let roadmap = Roadmap::load(&settings.roadmap_path(root));
    let files = phase_files(root, settings);
    roadmap
        .inline_sections()
        .into_iter()
        .filter_map(|section| {
            let file = files.iter().find(|f| f.number == section.number)?;
            Some(StorageConflict {
                number: section.number,
                inline_line: section.line.unwrap_or_default(),
                file: file.path.clone().unwrap_or_default(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ROADMAP: &str = "\
# Roadmap

| Phase | Name | Status |
|-------|------|--------|
| 0010 | Core Engine | ✅ Complete |
| 0020 | **API Layer** | 🔄 In Progress |
| 0030 | Dashboard | Not Started |

### 0020 - API Layer

**Status**: In Progress

Goals go here.

### 0030 - Dashboard

Nothing yet.
";

    fn project(roadmap: &str) -> (TempDir, PathSettings) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ROADMAP.md"), roadmap).unwrap();
        (dir, PathSettings::default())
    }

    #[test]
    fn status_parsing() {
        assert_eq!(PhaseStatus::parse("✅ Complete"), PhaseStatus::Completed);
        assert_eq!(PhaseStatus::parse("**Done**"), PhaseStatus::Completed);
        assert_eq!(PhaseStatus::parse("In Progress"), PhaseStatus::InProgress);
        assert_eq!(PhaseStatus::parse("Blocked on infra"), PhaseStatus::Blocked);
        assert_eq!(PhaseStatus::parse("deferred"), PhaseStatus::Deferred);
        assert_eq!(PhaseStatus::parse(""), PhaseStatus::NotStarted);
        assert_eq!(PhaseStatus::parse("Not Started"), PhaseStatus::NotStarted);
    }

    #[test]
    fn in_progress_wins_over_complete_wording() {
        assert_eq!(
            PhaseStatus::parse("In Progress (nearly complete)"),
            PhaseStatus::InProgress
        );
        assert_eq!(PhaseStatus::parse("🔄 done soon"), PhaseStatus::InProgress);
        assert_eq!(PhaseStatus::parse("Incomplete"), PhaseStatus::NotStarted);
    }

    #[test]
    fn table_rows_parsed_with_header_columns() {
        let roadmap = Roadmap {
            path: PathBuf::from("ROADMAP.md"),
            text: ROADMAP.to_string(),
            exists: true,
        };
        let rows = roadmap.rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].number, "0010");
        assert_eq!(rows[0].status, PhaseStatus::Completed);
        assert_eq!(rows[1].name, "API Layer");
        assert_eq!(rows[1].line, Some(6));
        assert_eq!(rows[2].status, PhaseStatus::NotStarted);
    }

    #[test]
    fn reordered_columns_follow_header() {
        let text = "| # | Status | Name |\n|---|---|---|\n| 001 | done | Core |\n";
        let roadmap = Roadmap {
            path: PathBuf::new(),
            text: text.to_string(),
            exists: true,
        };
        let row = roadmap.row("001").unwrap();
        assert_eq!(row.name, "Core");
        assert_eq!(row.status, PhaseStatus::Completed);
    }

    #[test]
    fn inline_sections_and_spans() {
        let roadmap = Roadmap {
            path: PathBuf::new(),
            text: ROADMAP.to_string(),
            exists: true,
        };
        let sections = roadmap.inline_sections();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].number, "0020");
        assert_eq!(sections[0].name, "API Layer");
        assert_eq!(sections[0].status, PhaseStatus::InProgress);
        assert_eq!(sections[1].status, PhaseStatus::NotStarted);

        let (start, end) = roadmap.inline_section_span("0020").unwrap();
        let lines: Vec<&str> = ROADMAP.lines().collect();
        assert!(lines[start].starts_with("### 0020"));
        assert!(lines[end].starts_with("### 0030"));
        assert!(roadmap.inline_section_span("0040").is_none());
    }

    #[test]
    fn missing_roadmap_is_empty() {
        let roadmap = Roadmap::load(Path::new("/nonexistent/ROADMAP.md"));
        assert!(!roadmap.exists);
        assert!(roadmap.rows().is_empty());
        assert_eq!(roadmap.format(), PhaseFormat::None);
    }

    #[test]
    fn phase_files_read_frontmatter_or_status_line() {
        let (dir, settings) = project("");
        let phases = dir.path().join(".specify/phases");
        std::fs::create_dir_all(&phases).unwrap();
        std::fs::write(phases.join("0010-core-engine.md"), "---\nstatus: complete\n---\n# Core\n").unwrap();
        std::fs::write(phases.join("0020-api.md"), "# API\n\n**Status:** blocked\n").unwrap();
        std::fs::write(phases.join("notes.md"), "not a phase").unwrap();

        let files = phase_files(dir.path(), &settings);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "core engine");
        assert_eq!(files[0].status, PhaseStatus::Completed);
        assert_eq!(files[1].status, PhaseStatus::Blocked);
    }

    #[test]
    fn lookup_prefers_file_then_inline_then_row() {
        let (dir, settings) = project(ROADMAP);
        assert_eq!(lookup(dir.path(), &settings, "0010").unwrap().source, PhaseSource::Table);
        let inline = lookup(dir.path(), &settings, "0030").unwrap();
        assert_eq!(inline.source, PhaseSource::Inline);

        let phases = dir.path().join(".specify/phases");
        std::fs::create_dir_all(&phases).unwrap();
        std::fs::write(phases.join("0010-core.md"), "**Status**: done\n").unwrap();
        let file = lookup(dir.path(), &settings, "0010").unwrap();
        assert_eq!(file.source, PhaseSource::File);
        assert!(lookup(dir.path(), &settings, "0099").is_none());
    }

    #[test]
    fn known_numbers_union() {
        let (dir, settings) = project(ROADMAP);
        let phases = dir.path().join(".specify/phases");
        std::fs::create_dir_all(&phases).unwrap();
        std::fs::write(phases.join("0040-extra.md"), "x").unwrap();
        assert_eq!(known_numbers(dir.path(), &settings), ["0010", "0020", "0030", "0040"]);
    }

    #[test]
    fn conflicting_storage_detected() {
        let (dir, settings) = project(ROADMAP);
        assert!(storage_conflicts(dir.path(), &settings).is_empty());
        let phases = dir.path().join(".specify/phases");
        std::fs::create_dir_all(&phases).unwrap();
        std::fs::write(phases.join("0020-api.md"), "x").unwrap();
        let conflicts = storage_conflicts(dir.path(), &settings);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].number, "0020");
        assert_eq!(conflicts[0].inline_line, 9);
    }
}
