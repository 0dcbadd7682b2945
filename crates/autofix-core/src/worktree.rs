//! Worktree lease management.
//!
//! A bounded pool of isolated working copies keyed by branch name. Each
//! lease owns one directory under `<base_dir>/<prefix><sanitized-branch>`;
//! the pool hands leases out, reclaims them on release, reaps stale ones on
//! a timer, and reconciles orphaned directories left behind by crashes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AutofixConfig;
use crate::error::ErrorCode;
use crate::vcs::{GitError, Vcs};

/// Branches that are never deleted, regardless of the release mode.
pub const PROTECTED_BRANCHES: &[&str] = &["main", "master", "develop"];

pub fn is_protected_branch(branch: &str) -> bool {
    PROTECTED_BRANCHES.contains(&branch)
}

/// Replace any character outside `[A-Za-z0-9-]` with `-` and collapse runs.
pub fn sanitize_branch(branch: &str) -> String {
    let mut out = String::with_capacity(branch.len());
    let mut last_dash = false;
    for c in branch.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out
}

/// Lifecycle annotation on a working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Creating,
    Ready,
    InUse,
    Completed,
    Failed,
}

/// Description of one working copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub status: WorktreeStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub issue_numbers: Vec<u64>,
    pub head: Option<String>,
}

/// An outstanding permit to use a working copy.
#[derive(Debug, Clone)]
pub struct WorktreeLease {
    pub lease_id: String,
    pub info: WorktreeInfo,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("maximum concurrent worktrees reached ({max})")]
    MaxConcurrentExceeded { max: usize },

    #[error("a lease already owns the worktree path {}", .path.display())]
    Exists { path: PathBuf },

    #[error("failed to acquire worktree for branch '{branch}': {cause}")]
    AcquireFailed {
        branch: String,
        #[source]
        cause: GitError,
    },

    #[error("failed to remove worktree at {}: {cause}", .path.display())]
    RemoveFailed {
        path: PathBuf,
        #[source]
        cause: GitError,
    },

    #[error("invalid worktree path: {0}")]
    PathError(String),

    #[error(transparent)]
    Git(#[from] GitError),
}

impl WorktreeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MaxConcurrentExceeded { .. } => ErrorCode::MaxConcurrentExceeded,
            Self::Exists { .. } => ErrorCode::WorktreeExists,
            Self::AcquireFailed { .. } => ErrorCode::AcquireFailed,
            Self::RemoveFailed { .. } => ErrorCode::WorktreeRemoveFailed,
            Self::PathError(_) => ErrorCode::PathError,
            Self::Git(_) => ErrorCode::GitError,
        }
    }
}

/// Pool parameters, usually derived from [`AutofixConfig`].
#[derive(Debug, Clone)]
pub struct WorktreeSettings {
    pub base_dir: PathBuf,
    pub prefix: String,
    pub max_concurrent: usize,
    pub base_branch: String,
    /// Remote the base branch is fetched from; `None` works fully locally.
    pub remote: Option<String>,
    /// Leases older than this are reaped by the auto-cleanup sweep.
    pub max_lease_age: Duration,
}

impl WorktreeSettings {
    pub fn from_config(cfg: &AutofixConfig) -> Self {
        Self {
            base_dir: cfg.worktree.base_dir.clone(),
            prefix: cfg.worktree.prefix.clone(),
            max_concurrent: cfg.queue.max_concurrent,
            base_branch: cfg.general.base_branch.clone(),
            remote: cfg.general.remote.clone(),
            max_lease_age: Duration::from_secs(cfg.worktree.auto_cleanup_minutes * 60),
        }
    }
}

struct ManagerInner<V: Vcs> {
    vcs: Arc<V>,
    settings: WorktreeSettings,
    leases: Mutex<HashMap<String, WorktreeLease>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Bounded pool of working copies. Internally synchronized; exposes no
/// scheduling decisions. Cloning is cheap and all clones share the pool.
pub struct WorktreeManager<V: Vcs> {
    inner: Arc<ManagerInner<V>>,
}

impl<V: Vcs> Clone for WorktreeManager<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Vcs> WorktreeManager<V> {
    pub fn new(vcs: Arc<V>, settings: WorktreeSettings) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                vcs,
                settings,
                leases: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &WorktreeSettings {
        &self.inner.settings
    }

    fn vcs(&self) -> &V {
        &self.inner.vcs
    }

    fn leases(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorktreeLease>> {
        self.inner.leases.lock().expect("lease map lock poisoned")
    }

    fn path_for(&self, branch: &str) -> PathBuf {
        let settings = self.settings();
        settings
            .base_dir
            .join(format!("{}{}", settings.prefix, sanitize_branch(branch)))
    }

    /// Acquire a lease for `branch`, creating the working copy from the tip
    /// of `base_branch` (defaulting to the configured base).
    pub async fn acquire(
        &self,
        branch: &str,
        issue_numbers: &[u64],
        base_branch: Option<&str>,
    ) -> Result<WorktreeLease, WorktreeError> {
        let base = base_branch.unwrap_or(&self.settings().base_branch);
        let path = self.path_for(branch);
        let lease_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        // Reserve the slot and the path under the lock so the count check
        // and the insert are one step.
        {
            let mut leases = self.leases();
            if leases.len() >= self.settings().max_concurrent {
                return Err(WorktreeError::MaxConcurrentExceeded {
                    max: self.settings().max_concurrent,
                });
            }
            if leases.values().any(|l| l.info.path == path) {
                return Err(WorktreeError::Exists { path });
            }
            leases.insert(
                lease_id.clone(),
                WorktreeLease {
                    lease_id: lease_id.clone(),
                    info: WorktreeInfo {
                        path: path.clone(),
                        branch: branch.to_string(),
                        status: WorktreeStatus::Creating,
                        created_at: now,
                        last_activity_at: now,
                        issue_numbers: issue_numbers.to_vec(),
                        head: None,
                    },
                    acquired_at: now,
                },
            );
        }

        match self.create_working_copy(&path, branch, base).await {
            Ok(head) => {
                let mut leases = self.leases();
                let lease = leases.get_mut(&lease_id).ok_or_else(|| {
                    WorktreeError::PathError("lease vanished during create".into())
                })?;
                lease.info.status = WorktreeStatus::Ready;
                lease.info.head = head;
                lease.info.last_activity_at = Utc::now();
                info!(lease_id, branch, path = %path.display(), "worktree lease acquired");
                Ok(lease.clone())
            }
            Err(cause) => {
                self.leases().remove(&lease_id);
                Err(WorktreeError::AcquireFailed {
                    branch: branch.to_string(),
                    cause,
                })
            }
        }
    }

    async fn create_working_copy(
        &self,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<Option<String>, GitError> {
        let mut base_ref = base.to_string();
        if let Some(remote) = &self.settings().remote {
            match self.vcs().fetch(remote).await {
                Ok(()) => base_ref = format!("{remote}/{base}"),
                Err(e) => warn!(error = %e, "fetch failed, using local base ref"),
            }
        }

        // An existing branch of the same name is not an error: drop it and
        // recreate from the base tip.
        if !is_protected_branch(branch) {
            if let Err(e) = self.vcs().delete_branch(branch).await {
                debug!(branch, error = %e, "pre-create branch delete skipped");
            }
        }

        self.vcs().create_worktree(path, branch, &base_ref).await?;

        let head = match self.vcs().exec(path, &["rev-parse", "HEAD"]).await {
            Ok(out) if out.success() => Some(out.stdout.trim().to_string()),
            _ => None,
        };
        Ok(head)
    }

    /// Return the working copy to the pool, keeping the branch. Unknown
    /// lease ids are a no-op.
    pub async fn release(&self, lease_id: &str) -> Result<(), WorktreeError> {
        self.release_inner(lease_id, false).await
    }

    /// As [`release`](Self::release), but also delete the local branch
    /// reference (protected branches excepted).
    pub async fn release_and_clean_branch(&self, lease_id: &str) -> Result<(), WorktreeError> {
        self.release_inner(lease_id, true).await
    }

    async fn release_inner(&self, lease_id: &str, delete_branch: bool) -> Result<(), WorktreeError> {
        let Some(lease) = self.leases().remove(lease_id) else {
            debug!(lease_id, "release of unknown lease id (no-op)");
            return Ok(());
        };

        let removal = self.vcs().remove_worktree(&lease.info.path, true).await;

        if delete_branch {
            if is_protected_branch(&lease.info.branch) {
                warn!(branch = %lease.info.branch, "refusing to delete protected branch");
            } else if let Err(e) = self.vcs().delete_branch(&lease.info.branch).await {
                debug!(branch = %lease.info.branch, error = %e, "branch delete on release skipped");
            }
        }

        match removal {
            Ok(()) => {
                info!(lease_id, path = %lease.info.path.display(), "worktree lease released");
                Ok(())
            }
            Err(cause) => Err(WorktreeError::RemoveFailed {
                path: lease.info.path,
                cause,
            }),
        }
    }

    pub fn get_active(&self) -> Vec<WorktreeInfo> {
        let leases = self.leases();
        let mut active: Vec<&WorktreeLease> = leases.values().collect();
        active.sort_by(|a, b| {
            a.acquired_at
                .cmp(&b.acquired_at)
                .then_with(|| a.lease_id.cmp(&b.lease_id))
        });
        active.into_iter().map(|l| l.info.clone()).collect()
    }

    pub fn get_active_count(&self) -> usize {
        self.leases().len()
    }

    pub fn can_acquire(&self) -> bool {
        self.get_active_count() < self.settings().max_concurrent
    }

    pub fn get_by_lease_id(&self, lease_id: &str) -> Option<WorktreeLease> {
        self.leases().get(lease_id).cloned()
    }

    pub fn get_by_path(&self, path: &Path) -> Option<WorktreeLease> {
        self.leases().values().find(|l| l.info.path == path).cloned()
    }

    /// Annotate a lease. Returns false for unknown ids.
    pub fn update_status(&self, lease_id: &str, status: WorktreeStatus) -> bool {
        match self.leases().get_mut(lease_id) {
            Some(lease) => {
                lease.info.status = status;
                lease.info.last_activity_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Every working copy known to the underlying VCS, not just leased ones.
    /// Unleased copies are probed for uncommitted changes; a failed probe
    /// counts as clean.
    pub async fn list_all(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let listings = self.vcs().list_worktrees().await?;
        let by_path: HashMap<PathBuf, WorktreeLease> = self
            .leases()
            .values()
            .map(|l| (l.info.path.clone(), l.clone()))
            .collect();

        let mut infos = Vec::with_capacity(listings.len());
        for listing in listings {
            if let Some(lease) = by_path.get(&listing.path) {
                let mut info = lease.info.clone();
                if info.head.is_none() {
                    info.head = listing.head;
                }
                infos.push(info);
            } else {
                let now = Utc::now();
                let status = if self.is_dirty(&listing.path).await {
                    WorktreeStatus::InUse
                } else {
                    WorktreeStatus::Ready
                };
                infos.push(WorktreeInfo {
                    path: listing.path,
                    branch: listing.branch,
                    status,
                    created_at: now,
                    last_activity_at: now,
                    issue_numbers: vec![],
                    head: listing.head,
                });
            }
        }
        Ok(infos)
    }

    /// Porcelain-status probe; probe failures count as clean.
    async fn is_dirty(&self, path: &Path) -> bool {
        match self.vcs().exec(path, &["status", "--porcelain"]).await {
            Ok(out) if out.success() => !out.stdout.trim().is_empty(),
            _ => false,
        }
    }

    /// Remove every prefixed working copy that no live lease owns. Returns
    /// the number removed; per-path failures are logged, never raised.
    pub async fn cleanup_orphaned(&self) -> usize {
        let listings = match self.vcs().list_worktrees().await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "orphan sweep could not list worktrees");
                return 0;
            }
        };

        let live_paths: HashSet<PathBuf> =
            self.leases().values().map(|l| l.info.path.clone()).collect();

        let mut removed = 0;
        for listing in listings {
            let prefixed = listing
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&self.settings().prefix));
            if !prefixed || live_paths.contains(&listing.path) {
                continue;
            }

            match self.vcs().remove_worktree(&listing.path, true).await {
                Ok(()) => {
                    removed += 1;
                    if !is_protected_branch(&listing.branch) {
                        if let Err(e) = self.vcs().delete_branch(&listing.branch).await {
                            debug!(branch = %listing.branch, error = %e, "orphan branch delete skipped");
                        }
                    }
                    info!(path = %listing.path.display(), "removed orphaned worktree");
                }
                Err(e) => {
                    warn!(path = %listing.path.display(), error = %e, "failed to remove orphaned worktree");
                }
            }
        }
        removed
    }

    /// Release every live lease, best-effort and concurrently.
    pub async fn cleanup_all(&self) {
        let ids: Vec<String> = self.leases().keys().cloned().collect();
        let results = join_all(ids.iter().map(|id| self.release_and_clean_branch(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                warn!(lease_id = %id, error = %e, "cleanup_all release failed");
            }
        }
    }

    /// Single stale-lease sweep: force-release every lease older than the
    /// configured max age. Returns the number reaped.
    pub async fn run_auto_cleanup(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.settings().max_lease_age)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let stale: Vec<String> = self
            .leases()
            .values()
            .filter(|l| l.acquired_at <= cutoff)
            .map(|l| l.lease_id.clone())
            .collect();

        let mut reaped = 0;
        for id in stale {
            warn!(lease_id = %id, "reaping stale worktree lease");
            if let Err(e) = self.release_and_clean_branch(&id).await {
                warn!(lease_id = %id, error = %e, "stale lease release failed");
            }
            reaped += 1;
        }
        reaped
    }
}

impl<V: Vcs + 'static> WorktreeManager<V> {
    /// Start the periodic stale sweep. Idempotent: at most one timer exists.
    pub fn start_auto_cleanup(&self) {
        let mut sweeper = self.inner.sweeper.lock().expect("sweeper lock poisoned");
        if sweeper.is_some() {
            return;
        }
        // tokio panics on a zero-period interval.
        let period = self.settings().max_lease_age.max(Duration::from_secs(1));
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh pool is
            // not swept on startup.
            interval.tick().await;
            loop {
                interval.tick().await;
                let reaped = manager.run_auto_cleanup().await;
                if reaped > 0 {
                    info!(reaped, "auto-cleanup reaped stale leases");
                }
            }
        });
        *sweeper = Some(handle);
    }

    /// Stop the periodic sweep, if running.
    pub fn stop_auto_cleanup(&self) {
        if let Some(handle) = self
            .inner
            .sweeper
            .lock()
            .expect("sweeper lock poisoned")
            .take()
        {
            handle.abort();
        }
    }

    pub fn auto_cleanup_running(&self) -> bool {
        self.inner
            .sweeper
            .lock()
            .expect("sweeper lock poisoned")
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::{GitCli, GitOutput, WorktreeListing};

    #[test]
    fn sanitize_replaces_and_collapses() {
        assert_eq!(sanitize_branch("fix/login-12"), "fix-login-12");
        assert_eq!(sanitize_branch("fix//weird__name"), "fix-weird-name");
        assert_eq!(sanitize_branch("UPPER.case"), "UPPER-case");
    }

    #[test]
    fn protected_branches() {
        for b in ["main", "master", "develop"] {
            assert!(is_protected_branch(b));
        }
        assert!(!is_protected_branch("fix/login-12"));
    }

    // -----------------------------------------------------------------
    // Fake-VCS tests: pool arithmetic without touching a real repository
    // -----------------------------------------------------------------

    #[derive(Default)]
    struct FakeVcs {
        worktrees: Mutex<Vec<WorktreeListing>>,
        deleted_branches: Mutex<Vec<String>>,
        fail_create: std::sync::atomic::AtomicBool,
    }

    impl FakeVcs {
        fn seed(&self, path: &str, branch: &str) {
            self.worktrees.lock().unwrap().push(WorktreeListing {
                path: PathBuf::from(path),
                head: None,
                branch: branch.to_string(),
            });
        }

        fn deleted(&self) -> Vec<String> {
            self.deleted_branches.lock().unwrap().clone()
        }
    }

    impl Vcs for FakeVcs {
        async fn fetch(&self, _remote: &str) -> Result<(), GitError> {
            Ok(())
        }

        async fn create_worktree(
            &self,
            path: &Path,
            branch: &str,
            _base: &str,
        ) -> Result<(), GitError> {
            if self.fail_create.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(GitError::NonZeroExit {
                    command: "git worktree add".into(),
                    code: Some(128),
                    stdout: String::new(),
                    stderr: "fatal: invalid reference".into(),
                });
            }
            self.worktrees.lock().unwrap().push(WorktreeListing {
                path: path.to_path_buf(),
                head: Some("abc123".into()),
                branch: branch.to_string(),
            });
            Ok(())
        }

        async fn remove_worktree(&self, path: &Path, _force: bool) -> Result<(), GitError> {
            self.worktrees.lock().unwrap().retain(|l| l.path != path);
            Ok(())
        }

        async fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
            self.deleted_branches
                .lock()
                .unwrap()
                .push(branch.to_string());
            Ok(())
        }

        async fn list_worktrees(&self) -> Result<Vec<WorktreeListing>, GitError> {
            Ok(self.worktrees.lock().unwrap().clone())
        }

        async fn exec(&self, _cwd: &Path, _args: &[&str]) -> Result<GitOutput, GitError> {
            Ok(GitOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: Some(0),
            })
        }
    }

    fn fake_settings(max_concurrent: usize) -> WorktreeSettings {
        WorktreeSettings {
            base_dir: PathBuf::from("/base"),
            prefix: "autofix-".into(),
            max_concurrent,
            base_branch: "autofixing".into(),
            remote: None,
            max_lease_age: Duration::from_secs(3600),
        }
    }

    fn fake_manager(max_concurrent: usize) -> WorktreeManager<FakeVcs> {
        WorktreeManager::new(Arc::new(FakeVcs::default()), fake_settings(max_concurrent))
    }

    #[tokio::test]
    async fn lease_cap_enforced_until_release() {
        let mgr = fake_manager(1);

        let lease = mgr.acquire("fix/b1", &[1], None).await.unwrap();
        assert_eq!(mgr.get_active_count(), 1);
        assert!(!mgr.can_acquire());

        let err = mgr.acquire("fix/b2", &[2], None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MaxConcurrentExceeded);

        mgr.release(&lease.lease_id).await.unwrap();
        assert!(mgr.can_acquire());
        mgr.acquire("fix/b2", &[2], None).await.unwrap();
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let mgr = fake_manager(2);
        let lease = mgr.acquire("fix/a", &[1], None).await.unwrap();
        mgr.release(&lease.lease_id).await.unwrap();
        // Second release of the same id is a no-op.
        mgr.release(&lease.lease_id).await.unwrap();
        mgr.release("no-such-lease").await.unwrap();
    }

    #[tokio::test]
    async fn lease_ids_are_unique() {
        let mgr = fake_manager(8);
        let mut seen = HashSet::new();
        for i in 0..5 {
            let lease = mgr
                .acquire(&format!("fix/u-{i}"), &[i], None)
                .await
                .unwrap();
            assert!(seen.insert(lease.lease_id.clone()));
            mgr.release(&lease.lease_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn duplicate_path_rejected() {
        let mgr = fake_manager(4);
        let _lease = mgr.acquire("fix/dup", &[1], None).await.unwrap();
        let err = mgr.acquire("fix/dup", &[2], None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::WorktreeExists);
    }

    #[tokio::test]
    async fn failed_create_rolls_back_reservation() {
        let vcs = Arc::new(FakeVcs::default());
        vcs.fail_create
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let mgr = WorktreeManager::new(Arc::clone(&vcs), fake_settings(1));

        let err = mgr.acquire("fix/nope", &[1], None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AcquireFailed);
        assert_eq!(mgr.get_active_count(), 0);
        assert!(mgr.can_acquire());
    }

    #[tokio::test]
    async fn orphan_cleanup_removes_only_unleased_prefixed_paths() {
        let vcs = Arc::new(FakeVcs::default());
        let mgr = WorktreeManager::new(Arc::clone(&vcs), fake_settings(4));

        vcs.seed("/repo", "main");
        let _lease = mgr.acquire("fix/active", &[1], None).await.unwrap();
        vcs.seed("/base/autofix-orphan", "fix/orphan");

        let removed = mgr.cleanup_orphaned().await;
        assert_eq!(removed, 1);

        let remaining = vcs.list_worktrees().await.unwrap();
        assert!(remaining.iter().any(|l| l.path == PathBuf::from("/repo")));
        assert!(remaining
            .iter()
            .any(|l| l.path == PathBuf::from("/base/autofix-fix-active")));
        assert!(!remaining
            .iter()
            .any(|l| l.path == PathBuf::from("/base/autofix-orphan")));
        assert!(vcs.deleted().contains(&"fix/orphan".to_string()));
    }

    #[tokio::test]
    async fn release_and_clean_branch_spares_protected() {
        let vcs = Arc::new(FakeVcs::default());
        let mgr = WorktreeManager::new(Arc::clone(&vcs), fake_settings(4));

        let lease = mgr.acquire("develop", &[], None).await.unwrap();
        mgr.release_and_clean_branch(&lease.lease_id).await.unwrap();
        assert!(!vcs.deleted().contains(&"develop".to_string()));

        let lease = mgr.acquire("fix/gone", &[], None).await.unwrap();
        mgr.release_and_clean_branch(&lease.lease_id).await.unwrap();
        assert!(vcs.deleted().contains(&"fix/gone".to_string()));
    }

    #[tokio::test]
    async fn update_status_annotates_live_lease() {
        let mgr = fake_manager(2);
        let lease = mgr.acquire("fix/s", &[1], None).await.unwrap();
        assert!(mgr.update_status(&lease.lease_id, WorktreeStatus::InUse));
        assert_eq!(
            mgr.get_by_lease_id(&lease.lease_id).unwrap().info.status,
            WorktreeStatus::InUse
        );
        assert!(!mgr.update_status("unknown", WorktreeStatus::Failed));
    }

    #[tokio::test]
    async fn stale_sweep_reaps_only_expired_leases() {
        let vcs = Arc::new(FakeVcs::default());
        let mut settings = fake_settings(4);
        settings.max_lease_age = Duration::from_secs(0);
        let stale_mgr = WorktreeManager::new(Arc::clone(&vcs), settings);
        stale_mgr.acquire("fix/old", &[1], None).await.unwrap();
        assert_eq!(stale_mgr.run_auto_cleanup().await, 1);
        assert_eq!(stale_mgr.get_active_count(), 0);

        let fresh_mgr = fake_manager(4);
        fresh_mgr.acquire("fix/new", &[1], None).await.unwrap();
        assert_eq!(fresh_mgr.run_auto_cleanup().await, 0);
        assert_eq!(fresh_mgr.get_active_count(), 1);
    }

    #[tokio::test]
    async fn start_auto_cleanup_is_idempotent() {
        let mgr = fake_manager(2);
        mgr.start_auto_cleanup();
        mgr.start_auto_cleanup();
        mgr.start_auto_cleanup();
        assert!(mgr.auto_cleanup_running());
        mgr.stop_auto_cleanup();
        assert!(!mgr.auto_cleanup_running());
        // Stopping again is harmless.
        mgr.stop_auto_cleanup();
    }

    #[tokio::test]
    async fn cleanup_all_drains_the_pool() {
        let mgr = fake_manager(4);
        mgr.acquire("fix/one", &[1], None).await.unwrap();
        mgr.acquire("fix/two", &[2], None).await.unwrap();
        assert_eq!(mgr.get_active_count(), 2);
        mgr.cleanup_all().await;
        assert_eq!(mgr.get_active_count(), 0);
    }

    #[tokio::test]
    async fn clones_share_the_pool() {
        let mgr = fake_manager(2);
        let other = mgr.clone();
        let lease = mgr.acquire("fix/shared", &[1], None).await.unwrap();
        assert_eq!(other.get_active_count(), 1);
        other.release(&lease.lease_id).await.unwrap();
        assert_eq!(mgr.get_active_count(), 0);
    }

    // -----------------------------------------------------------------
    // Real-git lifecycle, mirroring how the pool is used in production
    // -----------------------------------------------------------------

    async fn setup_test_repo() -> (tempfile::TempDir, PathBuf, Arc<GitCli>) {
        let tmp = tempfile::tempdir().expect("failed to create temp dir");
        let root = tmp.path().join("repo");
        tokio::fs::create_dir_all(&root).await.unwrap();
        let git = Arc::new(GitCli::new(root.clone()));

        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@autofix.dev"],
            vec!["config", "user.name", "Autofix Test"],
        ] {
            let out = git.exec(&root, &args).await.unwrap();
            assert!(out.success(), "git {args:?} failed: {}", out.stderr);
        }
        tokio::fs::write(root.join("README.md"), "# test repo\n")
            .await
            .unwrap();
        for args in [vec!["add", "."], vec!["commit", "-m", "initial commit"]] {
            let out = git.exec(&root, &args).await.unwrap();
            assert!(out.success(), "git {args:?} failed: {}", out.stderr);
        }

        (tmp, root, git)
    }

    fn repo_settings(tmp: &tempfile::TempDir, max_concurrent: usize) -> WorktreeSettings {
        WorktreeSettings {
            base_dir: tmp.path().join("worktrees"),
            prefix: "autofix-".into(),
            max_concurrent,
            base_branch: "HEAD".into(),
            remote: None,
            max_lease_age: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn acquire_release_lifecycle_with_real_git() {
        let (tmp, _root, git) = setup_test_repo().await;
        let mgr = WorktreeManager::new(git, repo_settings(&tmp, 2));

        let lease = mgr.acquire("fix/real-1", &[1, 2], None).await.unwrap();
        assert!(lease.info.path.exists());
        assert_eq!(lease.info.status, WorktreeStatus::Ready);
        assert!(lease.info.head.is_some());
        assert_eq!(lease.info.issue_numbers, vec![1, 2]);

        let all = mgr.list_all().await.unwrap();
        assert!(all.iter().any(|i| i.branch == "fix/real-1"));

        let path = lease.info.path.clone();
        mgr.release(&lease.lease_id).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn existing_branch_is_force_recreated() {
        let (tmp, _root, git) = setup_test_repo().await;
        let mgr = WorktreeManager::new(git, repo_settings(&tmp, 2));

        let lease = mgr.acquire("fix/again", &[1], None).await.unwrap();
        // Keep the branch (default release), then re-acquire the same name.
        mgr.release(&lease.lease_id).await.unwrap();

        let lease = mgr.acquire("fix/again", &[1], None).await.unwrap();
        assert!(lease.info.path.exists());
        mgr.release(&lease.lease_id).await.unwrap();
    }
}
