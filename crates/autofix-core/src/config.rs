use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::{AutofixError, Result};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutofixConfig {
    pub general: GeneralConfig,
    pub queue: QueueConfig,
    pub worktree: WorktreeConfig,
    pub checks: ChecksConfig,
    pub agent: AgentConfig,
    pub github: GitHubConfig,
}

impl AutofixConfig {
    /// Load config from a specific `autofix.toml` file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AutofixError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&contents).map_err(|e| {
            AutofixError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `./autofix.toml` if it exists, otherwise return defaults.
    pub fn load_or_default() -> Self {
        let path = PathBuf::from("autofix.toml");
        if path.exists() {
            match Self::load(&path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(%e, "failed to load autofix.toml, falling back to defaults");
                    Self::default()
                }
            }
        } else {
            Self::default()
        }
    }

    /// Validate the config and return actionable error messages.
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_concurrent == 0 {
            return Err(AutofixError::Config(
                "queue.max_concurrent must be > 0".into(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(AutofixError::Config("queue.max_attempts must be > 0".into()));
        }
        if self.queue.initial_backoff_ms == 0 {
            return Err(AutofixError::Config(
                "queue.initial_backoff_ms must be > 0".into(),
            ));
        }
        if self.queue.max_backoff_ms < self.queue.initial_backoff_ms {
            return Err(AutofixError::Config(
                "queue.max_backoff_ms must be >= queue.initial_backoff_ms".into(),
            ));
        }

        if self.general.base_branch.trim().is_empty() {
            return Err(AutofixError::Config(
                "general.base_branch must not be empty".into(),
            ));
        }

        if self.worktree.prefix.trim().is_empty() {
            return Err(AutofixError::Config(
                "worktree.prefix must not be empty".into(),
            ));
        }
        if self.worktree.auto_cleanup_minutes == 0 {
            return Err(AutofixError::Config(
                "worktree.auto_cleanup_minutes must be > 0".into(),
            ));
        }

        if self.checks.timeout_per_check_seconds == 0 {
            return Err(AutofixError::Config(
                "checks.timeout_per_check_seconds must be > 0".into(),
            ));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GeneralConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Base branch new working copies are created from.
    pub base_branch: String,
    /// Remote the base branch is fetched from; `None` works fully locally.
    pub remote: Option<String>,
    /// Skip commit, review-request creation, and issue updates.
    pub dry_run: bool,
    /// Identity used for the pipeline's commits.
    pub commit_author: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            base_branch: "autofixing".into(),
            remote: Some("origin".into()),
            dry_run: false,
            commit_author: "autofix-agent <autofix-agent@users.noreply.github.com>".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum concurrent pipeline invocations and outstanding leases.
    pub max_concurrent: usize,
    /// Per-group total attempts before terminal failure.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// WorktreeConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Directory the working copies live under.
    pub base_dir: PathBuf,
    /// Directory-name prefix that marks a working copy as ours.
    pub prefix: String,
    /// Stale-lease sweep interval and age threshold.
    pub auto_cleanup_minutes: u64,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(".autofix/worktrees"),
            prefix: "autofix-".into(),
            auto_cleanup_minutes: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// ChecksConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksConfig {
    /// Stop on the first failing check.
    pub fail_fast: bool,
    pub timeout_per_check_seconds: u64,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            fail_fast: true,
            timeout_per_check_seconds: 300,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// External code-generation CLI invoked per analyze/apply call.
    pub command: String,
    pub args: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "autofix-agent".into(),
            args: vec![],
            timeout_seconds: 600,
        }
    }
}

// ---------------------------------------------------------------------------
// GitHubConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub owner: String,
    pub repo: String,
    /// Environment variable the API token is read from.
    pub token_env: String,
    pub api_base: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            token_env: "GITHUB_TOKEN".into(),
            api_base: "https://api.github.com".into(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
