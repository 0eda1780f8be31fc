//! Read-only view of the project's version control.
//!
//! The engine never commits, merges or switches branches; it only compares
//! what git reports against what the state document recorded.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub trait VersionControl {
    /// `None` outside a repository, without git installed, or on a detached HEAD.
    fn current_branch(&self) -> Option<String>;
    fn has_uncommitted_changes(&self) -> bool;
    /// Commits `(ahead, behind)` the upstream, if one is configured.
    fn ahead_behind(&self) -> Option<(u32, u32)>;
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

pub struct Git {
    root: PathBuf,
}

impl Git {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn run(&self, args: &[&str]) -> Option<String> {
        if which::which("git").is_err() {
            tracing::debug!("git not found on PATH");
            return None;
        }
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .ok()?;
        if !output.status.success() {
            tracing::debug!(?args, code = ?output.status.code(), "git command failed");
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl VersionControl for Git {
    fn current_branch(&self) -> Option<String> {
        let branch = self.run(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        if branch.is_empty() || branch == "HEAD" {
            return None;
        }
        Some(branch)
    }

    fn has_uncommitted_changes(&self) -> bool {
        self.run(&["status", "--porcelain"])
            .is_some_and(|out| !out.is_empty())
    }

    fn ahead_behind(&self) -> Option<(u32, u32)> {
        let out = self.run(&["rev-list", "--left-right", "--count", "HEAD...@{upstream}"])?;
        parse_ahead_behind(&out)
    }
}

fn parse_ahead_behind(out: &str) -> Option<(u32, u32)> {
    let mut parts = out.split_whitespace();
    let ahead = parts.next()?.parse().ok()?;
    let behind = parts.next()?.parse().ok()?;
    Some((ahead, behind))
}

// ---------------------------------------------------------------------------
// FixedVcs
// ---------------------------------------------------------------------------

/// A version control view with canned answers.
#[derive(Debug, Clone, Default)]
pub struct FixedVcs {
    pub branch: Option<String>,
    pub dirty: bool,
    pub ahead_behind: Option<(u32, u32)>,
}

impl FixedVcs {
    pub fn on_branch(branch: &str) -> Self {
        Self {
            branch: Some(branch.to_string()),
            ..Self::default()
        }
    }
}

impl VersionControl for FixedVcs {
    fn current_branch(&self) -> Option<String> {
        self.branch.clone()
    }

    fn has_uncommitted_changes(&self) -> bool {
        self.dirty
    }

    fn ahead_behind(&self) -> Option<(u32, u32)> {
        self.ahead_behind
    }
}

// ---------------------------------------------------------------------------
// VcsSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VcsSnapshot {
    pub branch: Option<String>,
    pub uncommitted_changes: bool,
    pub ahead: Option<u32>,
    pub behind: Option<u32>,
}

impl VcsSnapshot {
    pub fn capture(vcs: &dyn VersionControl) -> Self {
        let ahead_behind = vcs.ahead_behind();
        Self {
            branch: vcs.current_branch(),
            uncommitted_changes: vcs.has_uncommitted_changes(),
            ahead: ahead_behind.map(|(a, _)| a),
            behind: ahead_behind.map(|(_, b)| b),
        }
    }
}
