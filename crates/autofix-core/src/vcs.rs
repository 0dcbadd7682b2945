//! Version-control adapter.
//!
//! The [`Vcs`] trait is the narrow seam the lease manager and pipeline
//! depend on; [`GitCli`] implements it by shelling out to `git` with a
//! wall-clock timeout. Tests inject in-memory fakes instead.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

pub const DEFAULT_GIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command timed out after {timeout_secs}s: {command}")]
    TimedOut { command: String, timeout_secs: u64 },

    #[error("git command failed with exit code {code:?}: {command}; stderr: {stderr}")]
    NonZeroExit {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("path is not valid UTF-8: {}", .0.display())]
    BadPath(PathBuf),

    #[error("failed to execute git command: {0}")]
    Io(#[from] std::io::Error),
}

/// One record from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeListing {
    pub path: PathBuf,
    pub head: Option<String>,
    pub branch: String,
}

/// Parse the porcelain block format: blocks separated by blank lines, each
/// contributing `worktree <path>`, `HEAD <sha>`, and `branch <refs/heads/..>`
/// lines. Blocks without a branch (detached HEAD) are skipped.
pub fn parse_worktree_list(porcelain: &str) -> Vec<WorktreeListing> {
    let mut listings = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head: Option<String> = None;
    let mut branch: Option<String> = None;

    let mut flush = |path: &mut Option<PathBuf>, head: &mut Option<String>, branch: &mut Option<String>| {
        if let (Some(p), Some(b)) = (path.take(), branch.take()) {
            listings.push(WorktreeListing {
                path: p,
                head: head.take(),
                branch: b,
            });
        }
        *head = None;
    };

    for line in porcelain.lines() {
        if line.is_empty() {
            flush(&mut path, &mut head, &mut branch);
        } else if let Some(p) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(p));
        } else if let Some(sha) = line.strip_prefix("HEAD ") {
            head = Some(sha.to_string());
        } else if let Some(r) = line.strip_prefix("branch ") {
            branch = Some(r.strip_prefix("refs/heads/").unwrap_or(r).to_string());
        }
    }
    flush(&mut path, &mut head, &mut branch);

    listings
}

/// Capability the lease manager and pipeline consume.
pub trait Vcs: Send + Sync {
    /// Fetch the given remote.
    fn fetch(&self, remote: &str) -> impl Future<Output = Result<(), GitError>> + Send;

    /// Create a working copy at `path`, (re)pointing `branch` at `base`.
    ///
    /// Atomic from the caller's standpoint: on failure nothing usable
    /// lingers at `path`.
    fn create_worktree(
        &self,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> impl Future<Output = Result<(), GitError>> + Send;

    /// Remove the working copy at `path`.
    fn remove_worktree(
        &self,
        path: &Path,
        force: bool,
    ) -> impl Future<Output = Result<(), GitError>> + Send;

    /// Force-delete a local branch reference.
    fn delete_branch(&self, branch: &str) -> impl Future<Output = Result<(), GitError>> + Send;

    /// Every working copy known to the repository.
    fn list_worktrees(&self)
        -> impl Future<Output = Result<Vec<WorktreeListing>, GitError>> + Send;

    /// Run an arbitrary subcommand inside `cwd`, capturing output and exit
    /// code. A non-zero exit is reported through [`GitOutput`], not as an
    /// error.
    fn exec(
        &self,
        cwd: &Path,
        args: &[&str],
    ) -> impl Future<Output = Result<GitOutput, GitError>> + Send;
}

/// `git` CLI adapter rooted at one repository.
#[derive(Debug, Clone)]
pub struct GitCli {
    repo_root: PathBuf,
    timeout: Duration,
}

impl GitCli {
    pub fn new(repo_root: PathBuf) -> Self {
        Self {
            repo_root,
            timeout: DEFAULT_GIT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(repo_root: PathBuf, timeout: Duration) -> Self {
        Self { repo_root, timeout }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Run `git` in `cwd` and capture everything; the exit code is reported,
    /// not checked.
    async fn run_unchecked(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        let command = render_command(args);
        debug!(cwd = %cwd.display(), %command, "running git");

        let mut child = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        let mut stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("stdout pipe missing"))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("stderr pipe missing"))?;

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout_pipe.read_to_end(&mut buf).await?;
            Ok::<Vec<u8>, std::io::Error>(buf)
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr_pipe.read_to_end(&mut buf).await?;
            Ok::<Vec<u8>, std::io::Error>(buf)
        });

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(GitError::Io(e)),
            Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                return Err(GitError::TimedOut {
                    command,
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        let stdout = stdout_task
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;
        let stderr = stderr_task
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;

        Ok(GitOutput {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_code: status.code(),
        })
    }

    /// As [`run_unchecked`](Self::run_unchecked), but a non-zero exit is an
    /// error.
    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        let output = self.run_unchecked(cwd, args).await?;
        if !output.success() {
            return Err(GitError::NonZeroExit {
                command: render_command(args),
                code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    fn path_str(path: &Path) -> Result<&str, GitError> {
        path.to_str().ok_or_else(|| GitError::BadPath(path.to_path_buf()))
    }
}

impl Vcs for GitCli {
    async fn fetch(&self, remote: &str) -> Result<(), GitError> {
        self.run(&self.repo_root, &["fetch", remote, "--prune"])
            .await?;
        Ok(())
    }

    async fn create_worktree(&self, path: &Path, branch: &str, base: &str) -> Result<(), GitError> {
        let path_str = Self::path_str(path)?;
        let result = self
            .run(
                &self.repo_root,
                &["worktree", "add", "-B", branch, path_str, base],
            )
            .await;

        if let Err(e) = result {
            // Leave nothing half-created behind.
            let _ = tokio::fs::remove_dir_all(path).await;
            let _ = self
                .run(&self.repo_root, &["worktree", "prune"])
                .await;
            return Err(e);
        }
        Ok(())
    }

    async fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), GitError> {
        let path_str = Self::path_str(path)?;
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_str);
        self.run(&self.repo_root, &args).await?;
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        self.run(&self.repo_root, &["branch", "-D", branch]).await?;
        Ok(())
    }

    async fn list_worktrees(&self) -> Result<Vec<WorktreeListing>, GitError> {
        let output = self
            .run(&self.repo_root, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_list(&output.stdout))
    }

    async fn exec(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        let output = self.run_unchecked(cwd, args).await?;
        if !output.success() {
            warn!(
                command = %render_command(args),
                code = ?output.exit_code,
                "git subcommand exited non-zero"
            );
        }
        Ok(output)
    }
}

fn render_command(args: &[&str]) -> String {
    if args.is_empty() {
        return "git".to_string();
    }
    format!("git {}", args.join(" "))
}
