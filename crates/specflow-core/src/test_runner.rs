//! Project test-command detection and synchronous execution.
//!
//! Only the exit code drives gate logic. Output is captured for display and
//! trimmed to the first [`CONTEXT_LINES`] lines.

use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

pub const CONTEXT_LINES: usize = 20;

/// The scaffold npm writes when a project has no tests.
const NPM_PLACEHOLDER_TEST: &str = "echo \"Error: no test specified\" && exit 1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub command: String,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// Leading lines of combined stdout/stderr.
    pub context: Vec<String>,
}

pub trait TestRunner {
    fn command(&self) -> &str;
    fn run(&self, root: &Path) -> TestOutcome;
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Pick the project's test command: explicit config first, then well-known
/// manifests whose tool is installed.
pub fn detect_test_command(root: &Path, cfg: &Config) -> Option<String> {
    if cfg.skip_tests {
        return None;
    }
    if let Some(cmd) = cfg.test_command.as_deref().map(str::trim) {
        if !cmd.is_empty() {
            return Some(cmd.to_string());
        }
    }

    let has = |name: &str| root.join(name).is_file();
    let installed = |tool: &str| which::which(tool).is_ok();

    if has("Cargo.toml") && installed("cargo") {
        return Some("cargo test".to_string());
    }
    if has("package.json") && npm_test_script(root) && installed("npm") {
        return Some("npm test".to_string());
    }
    if has("go.mod") && installed("go") {
        return Some("go test ./...".to_string());
    }
    if (has("pyproject.toml") || has("pytest.ini")) && installed("pytest") {
        return Some("pytest".to_string());
    }
    if has("Makefile") && makefile_has_test_target(root) && installed("make") {
        return Some("make test".to_string());
    }
    None
}

fn npm_test_script(root: &Path) -> bool {
    let Some(text) = crate::io::read_optional(&root.join("package.json")) else {
        return false;
    };
    let Ok(manifest) = serde_json::from_str::<serde_json::Value>(&text) else {
        return false;
    };
    manifest["scripts"]["test"]
        .as_str()
        .is_some_and(|s| !s.trim().is_empty() && s.trim() != NPM_PLACEHOLDER_TEST)
}

fn makefile_has_test_target(root: &Path) -> bool {
    crate::io::read_optional(&root.join("Makefile"))
        .is_some_and(|text| text.lines().any(|l| l.starts_with("test:")))
}

// ---------------------------------------------------------------------------
// ShellTestRunner
// ---------------------------------------------------------------------------

pub struct ShellTestRunner {
    command: String,
    timeout: Option<Duration>,
}

impl ShellTestRunner {
    pub fn new(command: impl Into<String>, timeout_seconds: u32) -> Self {
        Self {
            command: command.into(),
            timeout: (timeout_seconds > 0).then(|| Duration::from_secs(u64::from(timeout_seconds))),
        }
    }

    pub fn detect(root: &Path, cfg: &Config) -> Option<Self> {
        detect_test_command(root, cfg).map(|cmd| Self::new(cmd, cfg.test_timeout_seconds))
    }
}

impl TestRunner for ShellTestRunner {
    fn command(&self) -> &str {
        &self.command
    }

    fn run(&self, root: &Path) -> TestOutcome {
        tracing::info!(command = %self.command, "running project tests");
        let start = Instant::now();
        let result = execute(&self.command, root, self.timeout);
        let duration_ms = start.elapsed().as_millis() as u64;
        TestOutcome {
            command: self.command.clone(),
            passed: result.exit_code == Some(0) && !result.timed_out,
            exit_code: result.exit_code,
            timed_out: result.timed_out,
            duration_ms,
            context: leading_lines(&result.output, CONTEXT_LINES),
        }
    }
}

struct RawResult {
    exit_code: Option<i32>,
    timed_out: bool,
    output: String,
}

/// Run `command` through `sh -c`, reading both pipes on their own threads so
/// a chatty test suite cannot fill a pipe buffer and deadlock.
fn execute(command: &str, cwd: &Path, timeout: Option<Duration>) -> RawResult {
    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            return RawResult {
                exit_code: None,
                timed_out: false,
                output: format!("failed to spawn: {e}"),
            }
        }
    };

    let child_pid = child.id();
    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();
    let stdout_thread = std::thread::spawn(move || drain(stdout_handle));
    let stderr_thread = std::thread::spawn(move || drain(stderr_handle));

    let wait_result = match timeout {
        None => child.wait(),
        Some(limit) => {
            let (tx, rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let _ = tx.send(child.wait());
            });
            match rx.recv_timeout(limit) {
                Ok(result) => result,
                Err(_) => {
                    kill_process(child_pid);
                    return RawResult {
                        exit_code: None,
                        timed_out: true,
                        output: format!("timed out after {}s", limit.as_secs()),
                    };
                }
            }
        }
    };

    let stdout = stdout_thread.join().unwrap_or_default();
    let stderr = stderr_thread.join().unwrap_or_default();
    let output = match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
        (false, false) => format!("{stdout}\n{stderr}"),
        (true, false) => stderr,
        _ => stdout,
    };

    match wait_result {
        Ok(status) => RawResult {
            exit_code: status.code(),
            timed_out: false,
            output,
        },
        Err(e) => RawResult {
            exit_code: None,
            timed_out: false,
            output: format!("wait failed: {e}"),
        },
    }
}

fn drain<R: Read>(handle: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut r) = handle {
        let _ = r.read_to_string(&mut buf);
    }
    buf
}

/// Best-effort SIGKILL; errors are ignored.
fn kill_process(pid: u32) {
    let _ = Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

fn leading_lines(text: &str, n: usize) -> Vec<String> {
    text.trim()
        .lines()
        .take(n)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_command_wins() {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            test_command: Some("make check".to_string()),
            ..Config::default()
        };
        assert_eq!(detect_test_command(dir.path(), &cfg).as_deref(), Some("make check"));
    }

    #[test]
    fn skip_tests_disables_detection() {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            test_command: Some("make check".to_string()),
            skip_tests: true,
            ..Config::default()
        };
        assert!(detect_test_command(dir.path(), &cfg).is_none());
    }

    #[test]
    fn empty_project_has_no_runner() {
        let dir = TempDir::new().unwrap();
        assert!(detect_test_command(dir.path(), &Config::default()).is_none());
    }

    #[test]
    fn npm_placeholder_script_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            format!(r#"{{"scripts": {{"test": {}}}}}"#, serde_json::to_string(NPM_PLACEHOLDER_TEST).unwrap()),
        )
        .unwrap();
        assert!(!npm_test_script(dir.path()));
        std::fs::write(dir.path().join("package.json"), r#"{"scripts": {"test": "vitest"}}"#).unwrap();
        assert!(npm_test_script(dir.path()));
    }

    #[test]
    fn makefile_target_detection() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Makefile"), "build:\n\tcc main.c\n").unwrap();
        assert!(!makefile_has_test_target(dir.path()));
        std::fs::write(dir.path().join("Makefile"), "test: build\n\t./run\n").unwrap();
        assert!(makefile_has_test_target(dir.path()));
    }

    #[test]
    fn passing_command() {
        let dir = TempDir::new().unwrap();
        let outcome = ShellTestRunner::new("echo ok", 10).run(dir.path());
        assert!(outcome.passed);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.context, vec!["ok".to_string()]);
    }

    #[test]
    fn failing_command_keeps_exit_code() {
        let dir = TempDir::new().unwrap();
        let outcome = ShellTestRunner::new("echo broken >&2; exit 3", 10).run(dir.path());
        assert!(!outcome.passed);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.context, vec!["broken".to_string()]);
    }

    #[test]
    fn context_is_first_lines_only() {
        let dir = TempDir::new().unwrap();
        let outcome = ShellTestRunner::new("seq 1 100", 10).run(dir.path());
        assert_eq!(outcome.context.len(), CONTEXT_LINES);
        assert_eq!(outcome.context[0], "1");
    }

    #[test]
    fn timeout_reported() {
        let dir = TempDir::new().unwrap();
        let result = execute("sleep 60", dir.path(), Some(Duration::from_millis(150)));
        assert!(result.timed_out);
        assert!(result.output.contains("timed out"));
    }
}
