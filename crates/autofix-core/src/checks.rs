//! Verification checks (lint / typecheck / test) run inside a working copy.
//!
//! [`CommandCheckRunner`] discovers the project's package manager from its
//! lockfile, maps check names onto `package.json` scripts with sensible
//! fallbacks, and runs each check as a subprocess with a per-check timeout.

use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Lint,
    Typecheck,
    Test,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lint => "lint",
            Self::Typecheck => "typecheck",
            Self::Test => "test",
        }
    }

    /// The default set, in execution order.
    pub const ALL: [CheckKind; 3] = [CheckKind::Lint, CheckKind::Typecheck, CheckKind::Test];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    Timeout,
}

/// Per-check verdict with captured evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: CheckKind,
    pub status: CheckStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Aggregate verdict for one run of the check set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub passed: bool,
    pub results: Vec<CheckResult>,
    pub attempt: u32,
    pub total_duration_ms: u64,
}

impl CheckOutcome {
    pub fn timed_out(&self) -> bool {
        self.results.iter().any(|r| r.status == CheckStatus::Timeout)
    }

    pub fn failed_checks(&self) -> Vec<CheckKind> {
        self.results
            .iter()
            .filter(|r| r.status != CheckStatus::Passed)
            .map(|r| r.check)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub fail_fast: bool,
    pub timeout: Duration,
    pub attempt: u32,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            fail_fast: true,
            timeout: Duration::from_secs(300),
            attempt: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("dependency install failed: {detail}")]
    InstallFailed { detail: String },

    #[error("check tooling unavailable: {detail}")]
    Dependency { detail: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InstallFailed { .. } | Self::Io(_) => ErrorCode::InstallDepsFailed,
            Self::Dependency { .. } => ErrorCode::CheckDependencyError,
        }
    }
}

/// Capability the pipeline consumes for `install_deps` and `checks`.
pub trait CheckRunner: Send + Sync {
    fn install_deps(&self, dir: &Path) -> impl Future<Output = Result<(), CheckError>> + Send;

    fn run_checks(
        &self,
        dir: &Path,
        checks: &[CheckKind],
        opts: &CheckOptions,
    ) -> impl Future<Output = Result<CheckOutcome, CheckError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Pnpm,
    Yarn,
}

impl PackageManager {
    /// Lockfile-based discovery; npm is the fallback.
    pub fn detect(dir: &Path) -> Self {
        if dir.join("pnpm-lock.yaml").exists() {
            Self::Pnpm
        } else if dir.join("yarn.lock").exists() {
            Self::Yarn
        } else {
            Self::Npm
        }
    }

    pub fn binary(&self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Pnpm => "pnpm",
            Self::Yarn => "yarn",
        }
    }
}

/// Resolve the concrete command for a check: a `package.json` script when
/// the project defines one, otherwise a tool fallback via `npx`.
pub fn command_for_check(dir: &Path, pm: PackageManager, check: CheckKind) -> (String, Vec<String>) {
    let script = check.as_str();
    if has_script(dir, script) {
        return (
            pm.binary().to_string(),
            vec!["run".to_string(), script.to_string()],
        );
    }
    match check {
        CheckKind::Lint => ("npx".into(), vec!["eslint".into(), ".".into()]),
        CheckKind::Typecheck => ("npx".into(), vec!["tsc".into(), "--noEmit".into()]),
        CheckKind::Test => (
            "npx".into(),
            vec!["jest".into(), "--passWithNoTests".into()],
        ),
    }
}

fn has_script(dir: &Path, name: &str) -> bool {
    let Ok(contents) = std::fs::read_to_string(dir.join("package.json")) else {
        return false;
    };
    let Ok(manifest) = serde_json::from_str::<serde_json::Value>(&contents) else {
        return false;
    };
    manifest
        .get("scripts")
        .and_then(|s| s.get(name))
        .is_some()
}

/// Production check runner that shells out to the discovered toolchain.
#[derive(Debug, Clone, Default)]
pub struct CommandCheckRunner;

impl CommandCheckRunner {
    pub fn new() -> Self {
        Self
    }

    fn resolve_pm(dir: &Path) -> Result<PackageManager, CheckError> {
        let pm = PackageManager::detect(dir);
        which::which(pm.binary()).map_err(|e| CheckError::Dependency {
            detail: format!("{} not found on PATH: {e}", pm.binary()),
        })?;
        Ok(pm)
    }
}

impl CheckRunner for CommandCheckRunner {
    async fn install_deps(&self, dir: &Path) -> Result<(), CheckError> {
        let pm = Self::resolve_pm(dir)?;
        info!(pm = pm.binary(), dir = %dir.display(), "installing dependencies");

        let output = Command::new(pm.binary())
            .arg("install")
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CheckError::InstallFailed {
                detail: tail(&stderr, 2048),
            });
        }
        Ok(())
    }

    async fn run_checks(
        &self,
        dir: &Path,
        checks: &[CheckKind],
        opts: &CheckOptions,
    ) -> Result<CheckOutcome, CheckError> {
        let pm = Self::resolve_pm(dir)?;
        let started = Instant::now();
        let mut results = Vec::with_capacity(checks.len());

        for &check in checks {
            let (program, args) = command_for_check(dir, pm, check);
            let result = run_single_check(dir, check, &program, &args, opts.timeout).await;
            let ok = result.status == CheckStatus::Passed;
            results.push(result);
            if !ok && opts.fail_fast {
                debug!(check = check.as_str(), "stopping at first failing check");
                break;
            }
        }

        let passed =
            !results.is_empty() && results.iter().all(|r| r.status == CheckStatus::Passed);
        Ok(CheckOutcome {
            passed,
            results,
            attempt: opts.attempt,
            total_duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Run one check command to completion or timeout.
async fn run_single_check(
    cwd: &Path,
    check: CheckKind,
    program: &str,
    args: &[String],
    timeout: Duration,
) -> CheckResult {
    debug!(check = check.as_str(), program, ?args, "running check");
    let started = Instant::now();

    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(c) => c,
        Err(e) => {
            return CheckResult {
                check,
                status: CheckStatus::Failed,
                duration_ms: started.elapsed().as_millis() as u64,
                stdout: None,
                stderr: None,
                exit_code: None,
                error: Some(format!("failed to spawn '{program}': {e}")),
            }
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let status = if output.status.success() {
                CheckStatus::Passed
            } else {
                CheckStatus::Failed
            };
            CheckResult {
                check,
                status,
                duration_ms: started.elapsed().as_millis() as u64,
                stdout: Some(tail(&String::from_utf8_lossy(&output.stdout), 8192)),
                stderr: Some(tail(&String::from_utf8_lossy(&output.stderr), 8192)),
                exit_code: output.status.code(),
                error: None,
            }
        }
        Ok(Err(e)) => CheckResult {
            check,
            status: CheckStatus::Failed,
            duration_ms: started.elapsed().as_millis() as u64,
            stdout: None,
            stderr: None,
            exit_code: None,
            error: Some(e.to_string()),
        },
        Err(_) => {
            // kill_on_drop reaps the child when the wait future is dropped.
            warn!(check = check.as_str(), timeout_secs = timeout.as_secs(), "check timed out");
            CheckResult {
                check,
                status: CheckStatus::Timeout,
                duration_ms: started.elapsed().as_millis() as u64,
                stdout: None,
                stderr: None,
                exit_code: None,
                error: Some(format!("timed out after {}s", timeout.as_secs())),
            }
        }
    }
}

/// Keep the last `max` bytes of captured output, on a char boundary.
fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_prefers_pnpm_then_yarn() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(PackageManager::detect(tmp.path()), PackageManager::Npm);

        std::fs::write(tmp.path().join("yarn.lock"), "").unwrap();
        assert_eq!(PackageManager::detect(tmp.path()), PackageManager::Yarn);

        std::fs::write(tmp.path().join("pnpm-lock.yaml"), "").unwrap();
        assert_eq!(PackageManager::detect(tmp.path()), PackageManager::Pnpm);
    }

    #[test]
    fn defined_script_wins_over_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("package.json"),
            r#"{"scripts": {"lint": "eslint src", "test": "vitest run"}}"#,
        )
        .unwrap();

        let (program, args) = command_for_check(tmp.path(), PackageManager::Npm, CheckKind::Lint);
        assert_eq!(program, "npm");
        assert_eq!(args, vec!["run", "lint"]);

        let (program, args) =
            command_for_check(tmp.path(), PackageManager::Npm, CheckKind::Typecheck);
        assert_eq!(program, "npx");
        assert_eq!(args, vec!["tsc", "--noEmit"]);

        let (program, _) = command_for_check(tmp.path(), PackageManager::Pnpm, CheckKind::Test);
        assert_eq!(program, "pnpm");
    }

    #[test]
    fn missing_manifest_uses_fallbacks() {
        let tmp = tempfile::tempdir().unwrap();
        let (program, args) = command_for_check(tmp.path(), PackageManager::Npm, CheckKind::Test);
        assert_eq!(program, "npx");
        assert_eq!(args[0], "jest");
    }

    #[test]
    fn tail_keeps_suffix() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 10), "ab");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn single_check_passes_and_fails() {
        let tmp = tempfile::tempdir().unwrap();

        let ok = run_single_check(
            tmp.path(),
            CheckKind::Lint,
            "sh",
            &["-c".into(), "echo clean".into()],
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(ok.status, CheckStatus::Passed);
        assert!(ok.stdout.unwrap().contains("clean"));

        let bad = run_single_check(
            tmp.path(),
            CheckKind::Test,
            "sh",
            &["-c".into(), "echo 1 failing >&2; exit 1".into()],
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(bad.status, CheckStatus::Failed);
        assert_eq!(bad.exit_code, Some(1));
        assert!(bad.stderr.unwrap().contains("failing"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn single_check_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let result = run_single_check(
            tmp.path(),
            CheckKind::Test,
            "sh",
            &["-c".into(), "sleep 5".into()],
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(result.status, CheckStatus::Timeout);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[test]
    fn outcome_helpers() {
        let outcome = CheckOutcome {
            passed: false,
            results: vec![
                CheckResult {
                    check: CheckKind::Lint,
                    status: CheckStatus::Passed,
                    duration_ms: 10,
                    stdout: None,
                    stderr: None,
                    exit_code: Some(0),
                    error: None,
                },
                CheckResult {
                    check: CheckKind::Test,
                    status: CheckStatus::Timeout,
                    duration_ms: 500,
                    stdout: None,
                    stderr: None,
                    exit_code: None,
                    error: None,
                },
            ],
            attempt: 1,
            total_duration_ms: 510,
        };
        assert!(outcome.timed_out());
        assert_eq!(outcome.failed_checks(), vec![CheckKind::Test]);
    }
}
