use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for the autofix-core library.
#[derive(Debug, Error)]
pub enum AutofixError {
    /// Configuration parse or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Git subprocess error.
    #[error("git error: {0}")]
    Git(#[from] crate::vcs::GitError),

    /// Worktree lease error.
    #[error("worktree error: {0}")]
    Worktree(#[from] crate::worktree::WorktreeError),

    /// Code-generation agent error.
    #[error("agent error: {0}")]
    Agent(#[from] crate::agent::AgentError),

    /// Check runner error.
    #[error("check error: {0}")]
    Check(#[from] crate::checks::CheckError),

    /// Upstream tracker error.
    #[error("tracker error: {0}")]
    Tracker(#[from] crate::tracker::TrackerError),

    /// Processing queue misuse or lifecycle error.
    #[error("queue error: {0}")]
    Queue(String),

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, AutofixError>;

/// Stable error codes surfaced in pipeline results and queue events.
///
/// The wire form is the SCREAMING_SNAKE_CASE code string; the recoverable
/// subset drives the queue's retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PipelineInitFailed,
    WorktreeExists,
    WorktreeNotFound,
    BranchExists,
    GitError,
    PathError,
    MaxConcurrentExceeded,
    AcquireFailed,
    WorktreeCreateFailed,
    AiAnalysisFailed,
    AiFixFailed,
    InstallDepsFailed,
    CheckFailed,
    CheckTimeout,
    CheckDependencyError,
    WorktreeGitError,
    PrCreateFailed,
    PrExists,
    AuthFailed,
    BranchNotFound,
    ValidationFailed,
    ApiError,
    IssueUpdateFailed,
    NotFound,
    RateLimited,
    WorktreeRemoveFailed,
    PipelineFailed,
    PipelineInterrupted,
    PipelineTimeout,
    Unknown,
}

impl ErrorCode {
    /// The stable code string, identical to the serde wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PipelineInitFailed => "PIPELINE_INIT_FAILED",
            Self::WorktreeExists => "WORKTREE_EXISTS",
            Self::WorktreeNotFound => "WORKTREE_NOT_FOUND",
            Self::BranchExists => "BRANCH_EXISTS",
            Self::GitError => "GIT_ERROR",
            Self::PathError => "PATH_ERROR",
            Self::MaxConcurrentExceeded => "MAX_CONCURRENT_EXCEEDED",
            Self::AcquireFailed => "ACQUIRE_FAILED",
            Self::WorktreeCreateFailed => "WORKTREE_CREATE_FAILED",
            Self::AiAnalysisFailed => "AI_ANALYSIS_FAILED",
            Self::AiFixFailed => "AI_FIX_FAILED",
            Self::InstallDepsFailed => "INSTALL_DEPS_FAILED",
            Self::CheckFailed => "CHECK_FAILED",
            Self::CheckTimeout => "CHECK_TIMEOUT",
            Self::CheckDependencyError => "CHECK_DEPENDENCY_ERROR",
            Self::WorktreeGitError => "WORKTREE_GIT_ERROR",
            Self::PrCreateFailed => "PR_CREATE_FAILED",
            Self::PrExists => "PR_EXISTS",
            Self::AuthFailed => "AUTH_FAILED",
            Self::BranchNotFound => "BRANCH_NOT_FOUND",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::ApiError => "API_ERROR",
            Self::IssueUpdateFailed => "ISSUE_UPDATE_FAILED",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::WorktreeRemoveFailed => "WORKTREE_REMOVE_FAILED",
            Self::PipelineFailed => "PIPELINE_FAILED",
            Self::PipelineInterrupted => "PIPELINE_INTERRUPTED",
            Self::PipelineTimeout => "PIPELINE_TIMEOUT",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Whether a failure with this code may succeed on a later attempt.
    ///
    /// The generic fallbacks (`PIPELINE_FAILED`, `UNKNOWN`) are recoverable:
    /// they wrap thrown exceptions and unclassified failures, which carry no
    /// evidence of a permanent condition. Everything that identifies a
    /// permanent condition (auth, validation, an already-open review request,
    /// an exhausted lease pool) is not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AiAnalysisFailed
                | Self::AiFixFailed
                | Self::CheckFailed
                | Self::CheckTimeout
                | Self::RateLimited
                | Self::ApiError
                | Self::PipelineFailed
                | Self::Unknown
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_strings_match_wire_form() {
        let json = serde_json::to_string(&ErrorCode::MaxConcurrentExceeded).unwrap();
        assert_eq!(json, "\"MAX_CONCURRENT_EXCEEDED\"");
        assert_eq!(
            ErrorCode::MaxConcurrentExceeded.as_str(),
            "MAX_CONCURRENT_EXCEEDED"
        );
    }

    #[test]
    fn recoverable_set() {
        for code in [
            ErrorCode::AiAnalysisFailed,
            ErrorCode::AiFixFailed,
            ErrorCode::CheckFailed,
            ErrorCode::CheckTimeout,
            ErrorCode::RateLimited,
            ErrorCode::ApiError,
        ] {
            assert!(code.is_recoverable(), "{code} should be recoverable");
        }
        for code in [
            ErrorCode::AuthFailed,
            ErrorCode::ValidationFailed,
            ErrorCode::PrExists,
            ErrorCode::MaxConcurrentExceeded,
            ErrorCode::NotFound,
        ] {
            assert!(!code.is_recoverable(), "{code} should be permanent");
        }
    }

    #[test]
    fn display_uses_code_string() {
        assert_eq!(ErrorCode::RateLimited.to_string(), "RATE_LIMITED");
    }
}
