//! Processing pipeline: one issue group through the fixed stage sequence.
//!
//! `process_group` never panics or escapes an error: every failure is
//! reflected in the returned [`PipelineResult`], and an acquired lease is
//! released on every exit path. The pipeline is strictly sequential; all
//! concurrency lives in the queue.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::agent::{AnalysisReport, AppliedFix, FixAgent};
use crate::checks::{CheckKind, CheckOptions, CheckOutcome, CheckRunner};
use crate::config::AutofixConfig;
use crate::error::ErrorCode;
use crate::interrupt::InterruptController;
use crate::issue::IssueGroup;
use crate::tracker::{self, IssueTracker, ReviewRequest, ReviewRequestSpec};
use crate::vcs::Vcs;
use crate::worktree::{WorktreeManager, WorktreeStatus};

/// The closed stage enumeration, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Init,
    WorktreeCreate,
    AiAnalysis,
    AiFix,
    InstallDeps,
    Checks,
    Commit,
    PrCreate,
    IssueUpdate,
    Cleanup,
    Done,
}

impl PipelineStage {
    pub const ORDER: [PipelineStage; 11] = [
        Self::Init,
        Self::WorktreeCreate,
        Self::AiAnalysis,
        Self::AiFix,
        Self::InstallDeps,
        Self::Checks,
        Self::Commit,
        Self::PrCreate,
        Self::IssueUpdate,
        Self::Cleanup,
        Self::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::WorktreeCreate => "worktree_create",
            Self::AiAnalysis => "ai_analysis",
            Self::AiFix => "ai_fix",
            Self::InstallDeps => "install_deps",
            Self::Checks => "checks",
            Self::Commit => "commit",
            Self::PrCreate => "pr_create",
            Self::IssueUpdate => "issue_update",
            Self::Cleanup => "cleanup",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage failure: the stage it happened in, the stable code, and context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageError {
    pub stage: PipelineStage,
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub cause: Option<String>,
    /// Overrides the code's recoverable classification: the queue must not
    /// retry this failure. Set when a collaborator reports a condition it
    /// knows is permanent (e.g. the agent gave up rather than timed out).
    #[serde(default)]
    pub permanent: bool,
}

impl StageError {
    pub fn new(stage: PipelineStage, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            stage,
            code,
            message: message.into(),
            cause: None,
            permanent: false,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Mark this failure as not worth retrying, regardless of the code.
    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    /// Whether the queue may schedule another attempt after this failure.
    pub fn is_retryable(&self) -> bool {
        self.code.is_recoverable() && !self.permanent
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.stage, self.code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({cause})")?;
        }
        Ok(())
    }
}

impl std::error::Error for StageError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Completed,
    Failed,
    Skipped,
}

/// Terminal outcome of one pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub group: IssueGroup,
    pub status: PipelineStatus,
    /// 1-indexed attempt number this result belongs to.
    pub attempts: u32,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub pull_request: Option<ReviewRequest>,
    #[serde(default)]
    pub check_outcome: Option<CheckOutcome>,
    #[serde(default)]
    pub error_summary: Option<String>,
    #[serde(default)]
    pub error: Option<StageError>,
    pub stage_history: Vec<PipelineStage>,
}

impl PipelineResult {
    /// A bare completed result; used by stub processors and tests.
    pub fn completed(group: IssueGroup, attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            group,
            status: PipelineStatus::Completed,
            attempts: attempt,
            duration_ms: 0,
            started_at: now,
            completed_at: now,
            pull_request: None,
            check_outcome: None,
            error_summary: None,
            error: None,
            stage_history: vec![],
        }
    }

    /// A bare failed result carrying `error`; used when no pipeline ran
    /// (stub processors, synthesized panic failures).
    pub fn failure(group: IssueGroup, attempt: u32, error: StageError) -> Self {
        let now = Utc::now();
        Self {
            group,
            status: PipelineStatus::Failed,
            attempts: attempt,
            duration_ms: 0,
            started_at: now,
            completed_at: now,
            pull_request: None,
            check_outcome: None,
            error_summary: Some(error.to_string()),
            error: Some(error),
            stage_history: vec![],
        }
    }
}

type StageObserver = Box<dyn Fn(PipelineStage) + Send + Sync>;

struct PipelineContext {
    group: IssueGroup,
    attempt: u32,
    started_at: DateTime<Utc>,
    timer: Instant,
    current_stage: PipelineStage,
    stage_history: Vec<PipelineStage>,
    lease_id: Option<String>,
    worktree_path: Option<PathBuf>,
    analysis: Option<AnalysisReport>,
    fix: Option<AppliedFix>,
    check_outcome: Option<CheckOutcome>,
    pull_request: Option<ReviewRequest>,
}

impl PipelineContext {
    fn new(group: IssueGroup, attempt: u32) -> Self {
        Self {
            group,
            attempt,
            started_at: Utc::now(),
            timer: Instant::now(),
            current_stage: PipelineStage::Init,
            stage_history: vec![],
            lease_id: None,
            worktree_path: None,
            analysis: None,
            fix: None,
            check_outcome: None,
            pull_request: None,
        }
    }

    fn path(&self, stage: PipelineStage) -> Result<PathBuf, StageError> {
        self.worktree_path.clone().ok_or_else(|| {
            StageError::new(stage, ErrorCode::PipelineFailed, "no worktree in context")
        })
    }
}

/// The fixed-stage processing pipeline, generic over its collaborators.
pub struct Pipeline<V: Vcs, A: FixAgent, C: CheckRunner, T: IssueTracker> {
    config: AutofixConfig,
    vcs: Arc<V>,
    worktrees: WorktreeManager<V>,
    agent: A,
    checks: C,
    tracker: T,
    interrupt: InterruptController,
    observers: Mutex<Vec<StageObserver>>,
}

impl<V: Vcs, A: FixAgent, C: CheckRunner, T: IssueTracker> Pipeline<V, A, C, T> {
    pub fn new(
        config: AutofixConfig,
        vcs: Arc<V>,
        worktrees: WorktreeManager<V>,
        agent: A,
        checks: C,
        tracker: T,
    ) -> Self {
        Self {
            config,
            vcs,
            worktrees,
            agent,
            checks,
            tracker,
            interrupt: InterruptController::new(),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Shared handle to the pipeline's interrupt flag.
    pub fn interrupt(&self) -> InterruptController {
        self.interrupt.clone()
    }

    /// Subscribe to stage transitions. The handler fires after the pipeline
    /// has decided to enter the stage and must return quickly.
    pub fn on_stage_change(&self, handler: impl Fn(PipelineStage) + Send + Sync + 'static) {
        self.observers
            .lock()
            .expect("observer list lock poisoned")
            .push(Box::new(handler));
    }

    /// Run `group` to a terminal result. Never panics or returns early: the
    /// cleanup stage runs on every path.
    pub async fn process_group(&self, group: &IssueGroup, attempt: u32) -> PipelineResult {
        let mut cx = PipelineContext::new(group.clone(), attempt);
        info!(group = %cx.group.id, attempt, branch = %cx.group.branch, "pipeline started");

        let primary = self.run_stages(&mut cx).await.err();

        self.enter_stage(&mut cx, PipelineStage::Cleanup);
        self.stage_cleanup(&mut cx, primary.is_none()).await;
        self.enter_stage(&mut cx, PipelineStage::Done);

        let status = match &primary {
            None => PipelineStatus::Completed,
            Some(e) if e.code == ErrorCode::PipelineInterrupted && cx.lease_id.is_none() => {
                PipelineStatus::Skipped
            }
            Some(_) => PipelineStatus::Failed,
        };

        if let Some(error) = &primary {
            warn!(group = %cx.group.id, %error, "pipeline failed");
        } else {
            info!(
                group = %cx.group.id,
                pr = cx.pull_request.as_ref().map(|p| p.number),
                "pipeline completed"
            );
        }

        PipelineResult {
            status,
            attempts: cx.attempt,
            duration_ms: cx.timer.elapsed().as_millis() as u64,
            started_at: cx.started_at,
            completed_at: Utc::now(),
            pull_request: cx.pull_request,
            check_outcome: cx.check_outcome,
            error_summary: primary.as_ref().map(StageError::to_string),
            error: primary,
            stage_history: cx.stage_history,
            group: cx.group,
        }
    }

    async fn run_stages(&self, cx: &mut PipelineContext) -> Result<(), StageError> {
        self.enter_stage(cx, PipelineStage::Init);
        self.stage_init(cx)?;

        self.guard_interrupt(cx)?;
        self.enter_stage(cx, PipelineStage::WorktreeCreate);
        self.stage_worktree_create(cx).await?;

        self.guard_interrupt(cx)?;
        self.enter_stage(cx, PipelineStage::AiAnalysis);
        self.stage_ai_analysis(cx).await?;

        self.guard_interrupt(cx)?;
        self.enter_stage(cx, PipelineStage::AiFix);
        self.stage_ai_fix(cx).await?;

        self.guard_interrupt(cx)?;
        self.enter_stage(cx, PipelineStage::InstallDeps);
        self.stage_install_deps(cx).await?;

        self.guard_interrupt(cx)?;
        self.enter_stage(cx, PipelineStage::Checks);
        self.stage_checks(cx).await?;

        if self.config.general.dry_run {
            info!(group = %cx.group.id, "dry-run: skipping commit, pr_create, issue_update");
            return Ok(());
        }

        self.guard_interrupt(cx)?;
        self.enter_stage(cx, PipelineStage::Commit);
        self.stage_commit(cx).await?;

        self.guard_interrupt(cx)?;
        self.enter_stage(cx, PipelineStage::PrCreate);
        self.stage_pr_create(cx).await?;

        self.guard_interrupt(cx)?;
        self.enter_stage(cx, PipelineStage::IssueUpdate);
        self.stage_issue_update(cx).await?;

        Ok(())
    }

    fn enter_stage(&self, cx: &mut PipelineContext, stage: PipelineStage) {
        cx.current_stage = stage;
        cx.stage_history.push(stage);
        debug!(group = %cx.group.id, %stage, "entering stage");
        let observers = self.observers.lock().expect("observer list lock poisoned");
        for observer in observers.iter() {
            observer(stage);
        }
    }

    fn guard_interrupt(&self, cx: &PipelineContext) -> Result<(), StageError> {
        if self.interrupt.is_interrupted() {
            return Err(StageError::new(
                cx.current_stage,
                ErrorCode::PipelineInterrupted,
                "interrupt requested",
            ));
        }
        Ok(())
    }

    fn stage_init(&self, cx: &mut PipelineContext) -> Result<(), StageError> {
        cx.group.validate().map_err(|e| {
            StageError::new(
                PipelineStage::Init,
                ErrorCode::PipelineInitFailed,
                "group failed validation",
            )
            .with_cause(e.to_string())
        })?;
        self.guard_interrupt(cx)
    }

    async fn stage_worktree_create(&self, cx: &mut PipelineContext) -> Result<(), StageError> {
        let lease = self
            .worktrees
            .acquire(&cx.group.branch, &cx.group.issue_numbers(), None)
            .await
            .map_err(|e| {
                let code = e.code();
                StageError::new(
                    PipelineStage::WorktreeCreate,
                    code,
                    format!("lease acquisition failed for '{}'", cx.group.branch),
                )
                .with_cause(e.to_string())
            })?;
        self.worktrees
            .update_status(&lease.lease_id, WorktreeStatus::InUse);
        cx.worktree_path = Some(lease.info.path.clone());
        cx.lease_id = Some(lease.lease_id);
        Ok(())
    }

    async fn stage_ai_analysis(&self, cx: &mut PipelineContext) -> Result<(), StageError> {
        let path = cx.path(PipelineStage::AiAnalysis)?;
        let analysis = self.agent.analyze(&cx.group, &path).await.map_err(|e| {
            let err = StageError::new(
                PipelineStage::AiAnalysis,
                ErrorCode::AiAnalysisFailed,
                "agent analysis failed",
            )
            .with_cause(e.to_string());
            if e.is_transient() {
                err
            } else {
                err.permanent()
            }
        })?;
        info!(
            group = %cx.group.id,
            confidence = analysis.confidence,
            files = analysis.files_to_modify.len(),
            "analysis complete"
        );
        cx.analysis = Some(analysis);
        Ok(())
    }

    async fn stage_ai_fix(&self, cx: &mut PipelineContext) -> Result<(), StageError> {
        let path = cx.path(PipelineStage::AiFix)?;
        let analysis = cx.analysis.clone().ok_or_else(|| {
            StageError::new(
                PipelineStage::AiFix,
                ErrorCode::PipelineFailed,
                "no analysis in context",
            )
        })?;

        let fix = self
            .agent
            .apply(&cx.group, &path, &analysis)
            .await
            .map_err(|e| {
                let err = StageError::new(
                    PipelineStage::AiFix,
                    ErrorCode::AiFixFailed,
                    "agent apply failed",
                )
                .with_cause(e.to_string());
                if e.is_transient() {
                    err
                } else {
                    err.permanent()
                }
            })?;
        if !fix.success {
            return Err(StageError::new(
                PipelineStage::AiFix,
                ErrorCode::AiFixFailed,
                "agent reported an unsuccessful apply",
            )
            .with_cause(fix.summary));
        }

        // The fix must actually touch the tree.
        let status = self
            .vcs
            .exec(&path, &["status", "--porcelain"])
            .await
            .map_err(|e| {
                StageError::new(
                    PipelineStage::AiFix,
                    ErrorCode::AiFixFailed,
                    "status probe failed after apply",
                )
                .with_cause(e.to_string())
            })?;
        if status.success() && status.stdout.trim().is_empty() {
            return Err(StageError::new(
                PipelineStage::AiFix,
                ErrorCode::AiFixFailed,
                "apply produced no changes",
            ));
        }

        cx.fix = Some(fix);
        Ok(())
    }

    async fn stage_install_deps(&self, cx: &mut PipelineContext) -> Result<(), StageError> {
        let path = cx.path(PipelineStage::InstallDeps)?;
        self.checks.install_deps(&path).await.map_err(|e| {
            StageError::new(
                PipelineStage::InstallDeps,
                e.code(),
                "dependency install failed",
            )
            .with_cause(e.to_string())
        })
    }

    async fn stage_checks(&self, cx: &mut PipelineContext) -> Result<(), StageError> {
        let path = cx.path(PipelineStage::Checks)?;
        let opts = CheckOptions {
            fail_fast: self.config.checks.fail_fast,
            timeout: std::time::Duration::from_secs(self.config.checks.timeout_per_check_seconds),
            attempt: cx.attempt,
        };
        let outcome = self
            .checks
            .run_checks(&path, &CheckKind::ALL, &opts)
            .await
            .map_err(|e| {
                StageError::new(PipelineStage::Checks, e.code(), "check run could not start")
                    .with_cause(e.to_string())
            })?;

        // A run whose verdicts say "failed" is still a successful call; the
        // non-passing verdict fails this attempt.
        let passed = outcome.passed;
        let timed_out = outcome.timed_out();
        let failed: Vec<&'static str> = outcome.failed_checks().iter().map(|c| c.as_str()).collect();
        cx.check_outcome = Some(outcome);

        if !passed {
            let code = if timed_out {
                ErrorCode::CheckTimeout
            } else {
                ErrorCode::CheckFailed
            };
            return Err(StageError::new(
                PipelineStage::Checks,
                code,
                format!("checks did not pass: {}", failed.join(", ")),
            ));
        }
        Ok(())
    }

    async fn stage_commit(&self, cx: &mut PipelineContext) -> Result<(), StageError> {
        let path = cx.path(PipelineStage::Commit)?;
        let message = cx
            .fix
            .as_ref()
            .and_then(|f| f.commit_message.clone())
            .unwrap_or_else(|| cx.group.commit_subject());

        self.git_in_worktree(&path, &["add", "-A"]).await?;

        let (name, email) = split_author(&self.config.general.commit_author);
        let user_name = format!("user.name={name}");
        let user_email = format!("user.email={email}");
        self.git_in_worktree(
            &path,
            &["-c", &user_name, "-c", &user_email, "commit", "-m", &message],
        )
        .await?;
        Ok(())
    }

    async fn stage_pr_create(&self, cx: &mut PipelineContext) -> Result<(), StageError> {
        let path = cx.path(PipelineStage::PrCreate)?;

        if let Some(remote) = &self.config.general.remote {
            let push = self
                .vcs
                .exec(
                    &path,
                    &["push", "--force", "--set-upstream", remote, &cx.group.branch],
                )
                .await;
            let failure = match push {
                Ok(out) if out.success() => None,
                Ok(out) => Some(out.stderr),
                Err(e) => Some(e.to_string()),
            };
            if let Some(cause) = failure {
                return Err(StageError::new(
                    PipelineStage::PrCreate,
                    ErrorCode::PrCreateFailed,
                    format!("failed to push '{}' to {remote}", cx.group.branch),
                )
                .with_cause(cause));
            }
        }

        let spec = ReviewRequestSpec {
            title: cx.group.commit_subject(),
            body: cx.group.review_request_body(),
            head: cx.group.branch.clone(),
            base: self.config.general.base_branch.clone(),
            issue_numbers: cx.group.issue_numbers(),
            labels: cx.group.labels(),
            reviewers: vec![],
            draft: false,
        };
        let pr = self
            .tracker
            .create_review_request(&spec)
            .await
            .map_err(|e| {
                // A 404 here means the head branch never made it upstream.
                let code = match e.code() {
                    ErrorCode::NotFound => ErrorCode::BranchNotFound,
                    code => code,
                };
                StageError::new(
                    PipelineStage::PrCreate,
                    code,
                    "review request creation failed",
                )
                .with_cause(e.to_string())
            })?;
        info!(group = %cx.group.id, pr = pr.number, url = %pr.url, "review request opened");
        cx.pull_request = Some(pr);
        Ok(())
    }

    async fn stage_issue_update(&self, cx: &mut PipelineContext) -> Result<(), StageError> {
        let pr = cx.pull_request.clone().ok_or_else(|| {
            StageError::new(
                PipelineStage::IssueUpdate,
                ErrorCode::PipelineFailed,
                "no review request in context",
            )
        })?;

        let update = tracker::in_progress_update(&pr);
        for issue in &cx.group.issues {
            self.tracker
                .update_issue(issue.number, &update)
                .await
                .map_err(|e| {
                    let code = match e.code() {
                        code @ (ErrorCode::NotFound | ErrorCode::RateLimited) => code,
                        _ => ErrorCode::IssueUpdateFailed,
                    };
                    StageError::new(
                        PipelineStage::IssueUpdate,
                        code,
                        format!("failed to update issue #{}", issue.number),
                    )
                    .with_cause(e.to_string())
                })?;
        }
        Ok(())
    }

    /// Always runs. Success keeps the branch (the open review request
    /// references it); failure deletes it. Release failures are logged and
    /// recorded but never override the primary error.
    async fn stage_cleanup(&self, cx: &mut PipelineContext, success: bool) {
        let Some(lease_id) = cx.lease_id.take() else {
            return;
        };
        self.worktrees.update_status(
            &lease_id,
            if success {
                WorktreeStatus::Completed
            } else {
                WorktreeStatus::Failed
            },
        );

        let result = if success {
            self.worktrees.release(&lease_id).await
        } else {
            self.worktrees.release_and_clean_branch(&lease_id).await
        };
        if let Err(e) = result {
            // WORKTREE_REMOVE_FAILED is logged, never promoted over the
            // primary error.
            warn!(
                group = %cx.group.id,
                code = %ErrorCode::WorktreeRemoveFailed,
                error = %e,
                "lease release failed during cleanup"
            );
        }
    }

    async fn git_in_worktree(&self, path: &std::path::Path, args: &[&str]) -> Result<(), StageError> {
        let output = self.vcs.exec(path, args).await.map_err(|e| {
            StageError::new(
                PipelineStage::Commit,
                ErrorCode::WorktreeGitError,
                format!("git {} failed", args.first().copied().unwrap_or("")),
            )
            .with_cause(e.to_string())
        })?;
        if !output.success() {
            return Err(StageError::new(
                PipelineStage::Commit,
                ErrorCode::WorktreeGitError,
                format!("git {} exited non-zero", args.join(" ")),
            )
            .with_cause(output.stderr));
        }
        Ok(())
    }
}

/// Split a `Name <email>` identity; a bare name gets a placeholder address.
fn split_author(author: &str) -> (String, String) {
    if let (Some(open), Some(close)) = (author.find('<'), author.rfind('>')) {
        if open < close {
            let name = author[..open].trim().to_string();
            let email = author[open + 1..close].trim().to_string();
            if !name.is_empty() && !email.is_empty() {
                return (name, email);
            }
        }
    }
    (author.trim().to_string(), "autofix@localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_is_fixed() {
        assert_eq!(PipelineStage::ORDER.len(), 11);
        assert_eq!(PipelineStage::ORDER[0], PipelineStage::Init);
        assert_eq!(PipelineStage::ORDER[9], PipelineStage::Cleanup);
        assert_eq!(PipelineStage::ORDER[10], PipelineStage::Done);
    }

    #[test]
    fn stage_names_are_wire_stable() {
        assert_eq!(PipelineStage::WorktreeCreate.as_str(), "worktree_create");
        assert_eq!(
            serde_json::to_string(&PipelineStage::PrCreate).unwrap(),
            "\"pr_create\""
        );
    }

    #[test]
    fn stage_error_display_includes_code() {
        let err = StageError::new(
            PipelineStage::Checks,
            ErrorCode::CheckFailed,
            "checks did not pass: lint",
        )
        .with_cause("eslint exit 1");
        let text = err.to_string();
        assert!(text.contains("checks"));
        assert!(text.contains("CHECK_FAILED"));
        assert!(text.contains("eslint exit 1"));
    }

    #[test]
    fn permanent_marker_blocks_retry() {
        let err = StageError::new(
            PipelineStage::AiAnalysis,
            ErrorCode::AiAnalysisFailed,
            "flaky agent",
        );
        assert!(err.is_retryable());
        assert!(!err.clone().permanent().is_retryable());

        // Non-recoverable codes are never retryable, marker or not.
        let auth = StageError::new(PipelineStage::PrCreate, ErrorCode::AuthFailed, "bad token");
        assert!(!auth.is_retryable());
    }

    #[test]
    fn split_author_variants() {
        let (name, email) = split_author("Fix Bot <bot@example.com>");
        assert_eq!(name, "Fix Bot");
        assert_eq!(email, "bot@example.com");

        let (name, email) = split_author("just-a-name");
        assert_eq!(name, "just-a-name");
        assert_eq!(email, "autofix@localhost");
    }

    #[test]
    fn failure_result_preserves_error() {
        let group = crate::queue::test_support::group("g-x");
        let err = StageError::new(
            PipelineStage::AiAnalysis,
            ErrorCode::AiAnalysisFailed,
            "boom",
        );
        let result = PipelineResult::failure(group, 2, err);
        assert_eq!(result.status, PipelineStatus::Failed);
        assert_eq!(result.attempts, 2);
        assert!(result.error_summary.unwrap().contains("AI_ANALYSIS_FAILED"));
    }
}
