//! Code-generation agent capability.
//!
//! The agent is always an external collaborator: the pipeline speaks to it
//! through [`FixAgent`] and never hosts it in-process. [`CliFixAgent`] is
//! the production implementation, driving a configured CLI with a JSON
//! request on stdin and a JSON report on stdout.

use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::issue::IssueGroup;

/// Exit code conventionally used by agents for "try again later"
/// (BSD `EX_TEMPFAIL`).
const EXIT_TEMPFAIL: i32 = 75;

/// Estimated difficulty of the proposed fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixComplexity {
    Trivial,
    Moderate,
    Complex,
}

/// Result of the analyze operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Issue numbers the analysis covered.
    pub issues: Vec<u64>,
    pub files_to_modify: Vec<String>,
    pub root_cause: String,
    pub suggested_fix: String,
    /// 0.0 ..= 1.0
    pub confidence: f64,
    pub complexity: FixComplexity,
}

/// Result of the apply operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedFix {
    pub files_modified: Vec<String>,
    pub summary: String,
    pub success: bool,
    #[serde(default)]
    pub commit_message: Option<String>,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent process failed: {detail}")]
    Process { detail: String, transient: bool },

    #[error("agent returned malformed output: {0}")]
    Malformed(String),

    #[error("agent timed out after {seconds}s")]
    TimedOut { seconds: u64 },

    #[error("agent reported failure: {0}")]
    Reported(String),
}

impl AgentError {
    /// Transient failures may be retried by the queue; permanent ones
    /// terminate the item.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Process { transient, .. } => *transient,
            Self::TimedOut { .. } => true,
            Self::Malformed(_) | Self::Reported(_) => false,
        }
    }
}

/// Capability the pipeline consumes for the analyze/apply stages.
pub trait FixAgent: Send + Sync {
    fn analyze(
        &self,
        group: &IssueGroup,
        worktree: &Path,
    ) -> impl Future<Output = Result<AnalysisReport, AgentError>> + Send;

    fn apply(
        &self,
        group: &IssueGroup,
        worktree: &Path,
        analysis: &AnalysisReport,
    ) -> impl Future<Output = Result<AppliedFix, AgentError>> + Send;
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum AgentRequest<'a> {
    Analyze {
        group: &'a IssueGroup,
    },
    Apply {
        group: &'a IssueGroup,
        analysis: &'a AnalysisReport,
    },
}

/// Drives an external agent CLI. The worktree path becomes the process's
/// working directory so the agent only ever sees its own isolated copy.
#[derive(Debug, Clone)]
pub struct CliFixAgent {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CliFixAgent {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self::new(
            cfg.command.clone(),
            cfg.args.clone(),
            Duration::from_secs(cfg.timeout_seconds),
        )
    }

    async fn invoke<T: for<'de> Deserialize<'de>>(
        &self,
        worktree: &Path,
        request: &AgentRequest<'_>,
    ) -> Result<T, AgentError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| AgentError::Malformed(format!("request serialization: {e}")))?;

        debug!(program = %self.program, worktree = %worktree.display(), "invoking agent");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(worktree)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AgentError::Process {
                detail: format!("failed to spawn '{}': {e}", self.program),
                transient: false,
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| AgentError::Process {
            detail: "stdin pipe missing".into(),
            transient: false,
        })?;
        let mut stdout = child.stdout.take().ok_or_else(|| AgentError::Process {
            detail: "stdout pipe missing".into(),
            transient: false,
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| AgentError::Process {
            detail: "stderr pipe missing".into(),
            transient: false,
        })?;

        let write_task = tokio::spawn(async move {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await
        });
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| buf)
        });

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(AgentError::Process {
                    detail: format!("wait failed: {e}"),
                    transient: false,
                })
            }
            Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Err(AgentError::TimedOut {
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        let _ = write_task.await;
        let stdout = stdout_task
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();
        let stderr = stderr_task
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();

        if !status.success() {
            let detail = String::from_utf8_lossy(&stderr).trim().to_string();
            warn!(code = ?status.code(), %detail, "agent exited non-zero");
            return Err(AgentError::Process {
                detail: if detail.is_empty() {
                    format!("exit code {:?}", status.code())
                } else {
                    detail
                },
                transient: status.code() == Some(EXIT_TEMPFAIL),
            });
        }

        parse_report(&String::from_utf8_lossy(&stdout))
    }
}

/// Parse the agent's report: the last line of stdout that is a JSON object.
/// Agents are free to chat on earlier lines.
fn parse_report<T: for<'de> Deserialize<'de>>(stdout: &str) -> Result<T, AgentError> {
    let candidate = stdout
        .lines()
        .rev()
        .find(|l| l.trim_start().starts_with('{'))
        .ok_or_else(|| AgentError::Malformed("no JSON object in agent output".into()))?;
    serde_json::from_str(candidate.trim()).map_err(|e| AgentError::Malformed(e.to_string()))
}

impl FixAgent for CliFixAgent {
    async fn analyze(
        &self,
        group: &IssueGroup,
        worktree: &Path,
    ) -> Result<AnalysisReport, AgentError> {
        self.invoke(worktree, &AgentRequest::Analyze { group }).await
    }

    async fn apply(
        &self,
        group: &IssueGroup,
        worktree: &Path,
        analysis: &AnalysisReport,
    ) -> Result<AppliedFix, AgentError> {
        self.invoke(worktree, &AgentRequest::Apply { group, analysis })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::{IssuePriority, IssueType};

    fn test_group() -> IssueGroup {
        IssueGroup {
            id: "g-1".into(),
            name: "test".into(),
            grouping_key: "t".into(),
            branch: "fix/test-1".into(),
            issues: vec![crate::issue::Issue {
                number: 1,
                title: "t".into(),
                body: String::new(),
                labels: vec![],
                issue_type: IssueType::Bug,
                priority: IssuePriority::Medium,
                assignees: vec![],
                related_files: vec![],
                related_issues: vec![],
                acceptance_criteria: vec![],
                source_url: None,
            }],
            components: vec![],
            priority: IssuePriority::Medium,
            related_files: vec![],
        }
    }

    #[test]
    fn parse_report_takes_last_json_line() {
        let stdout = "thinking...\nstill thinking\n{\"files_modified\":[\"a.ts\"],\"summary\":\"done\",\"success\":true}\n";
        let fix: AppliedFix = parse_report(stdout).unwrap();
        assert!(fix.success);
        assert_eq!(fix.files_modified, vec!["a.ts"]);
        assert!(fix.commit_message.is_none());
    }

    #[test]
    fn parse_report_rejects_chatter_only() {
        let err = parse_report::<AppliedFix>("no json here\n").unwrap_err();
        assert!(matches!(err, AgentError::Malformed(_)));
    }

    #[test]
    fn transient_classification() {
        assert!(AgentError::TimedOut { seconds: 1 }.is_transient());
        assert!(AgentError::Process {
            detail: "x".into(),
            transient: true
        }
        .is_transient());
        assert!(!AgentError::Reported("gave up".into()).is_transient());
        assert!(!AgentError::Malformed("bad".into()).is_transient());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_agent_round_trip_via_shell() {
        let tmp = tempfile::tempdir().unwrap();
        // An "agent" that ignores stdin and prints a canned analysis.
        let agent = CliFixAgent::new(
            "sh",
            vec![
                "-c".into(),
                r#"cat > /dev/null; echo '{"issues":[1],"files_to_modify":["src/a.ts"],"root_cause":"off by one","suggested_fix":"clamp","confidence":0.9,"complexity":"trivial"}'"#.into(),
            ],
            Duration::from_secs(10),
        );

        let report = agent.analyze(&test_group(), tmp.path()).await.unwrap();
        assert_eq!(report.issues, vec![1]);
        assert_eq!(report.complexity, FixComplexity::Trivial);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_agent_tempfail_exit_is_transient() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = CliFixAgent::new(
            "sh",
            vec!["-c".into(), "cat > /dev/null; exit 75".into()],
            Duration::from_secs(10),
        );

        let err = agent.analyze(&test_group(), tmp.path()).await.unwrap_err();
        assert!(err.is_transient(), "exit 75 should be transient: {err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_agent_hard_failure_is_permanent() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = CliFixAgent::new(
            "sh",
            vec!["-c".into(), "cat > /dev/null; echo broken >&2; exit 1".into()],
            Duration::from_secs(10),
        );

        let err = agent.analyze(&test_group(), tmp.path()).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_agent_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = CliFixAgent::new(
            "sh",
            vec!["-c".into(), "sleep 5".into()],
            Duration::from_millis(100),
        );

        let err = agent.analyze(&test_group(), tmp.path()).await.unwrap_err();
        assert!(matches!(err, AgentError::TimedOut { .. }));
    }
}
