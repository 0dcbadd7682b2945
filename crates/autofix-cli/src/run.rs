//! The `run` and `cleanup` subcommands: wire the collaborators together,
//! drive the queue, and print the aggregated report.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use tracing::{info, warn};

use autofix_core::agent::CliFixAgent;
use autofix_core::checks::CommandCheckRunner;
use autofix_core::config::AutofixConfig;
use autofix_core::issue::IssueGroup;
use autofix_core::pipeline::Pipeline;
use autofix_core::queue::{ProcessQueue, QueueSettings};
use autofix_core::report::RunReport;
use autofix_core::tracker::github::GitHubTracker;
use autofix_core::vcs::GitCli;
use autofix_core::worktree::{WorktreeManager, WorktreeSettings};

#[derive(Args)]
pub struct RunArgs {
    /// JSON manifest of issue groups to repair.
    #[arg(long)]
    pub groups: PathBuf,

    /// Path to autofix.toml (defaults to ./autofix.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Repository root (defaults to the current directory).
    #[arg(long)]
    pub repo: Option<PathBuf>,

    /// Skip commit, review-request creation, and issue updates.
    #[arg(long)]
    pub dry_run: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<AutofixConfig> {
    match path {
        Some(path) => AutofixConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(AutofixConfig::load_or_default()),
    }
}

fn repo_root(arg: Option<PathBuf>) -> Result<PathBuf> {
    match arg {
        Some(path) => Ok(path),
        None => std::env::current_dir().context("resolving current directory"),
    }
}

pub async fn run(args: RunArgs) -> Result<i32> {
    let mut config = load_config(args.config.as_ref())?;
    if args.dry_run {
        config.general.dry_run = true;
    }

    let manifest = std::fs::read_to_string(&args.groups)
        .with_context(|| format!("reading group manifest {}", args.groups.display()))?;
    let groups: Vec<IssueGroup> =
        serde_json::from_str(&manifest).context("parsing group manifest")?;
    if groups.is_empty() {
        info!("nothing to do: the group manifest is empty");
        return Ok(0);
    }
    for group in &groups {
        group.validate()?;
    }

    let root = repo_root(args.repo)?;
    let vcs = Arc::new(GitCli::new(root));
    let worktrees = WorktreeManager::new(Arc::clone(&vcs), WorktreeSettings::from_config(&config));
    worktrees.start_auto_cleanup();

    let token = match std::env::var(&config.github.token_env) {
        Ok(token) => token,
        Err(_) if config.general.dry_run => String::new(),
        Err(_) => bail!(
            "environment variable {} is not set (required unless --dry-run)",
            config.github.token_env
        ),
    };
    let tracker = GitHubTracker::new(&config.github, token)?;

    let pipeline = Pipeline::new(
        config.clone(),
        Arc::clone(&vcs),
        worktrees.clone(),
        CliFixAgent::from_config(&config.agent),
        CommandCheckRunner::new(),
        tracker,
    );
    let interrupt = pipeline.interrupt();

    let queue = Arc::new(ProcessQueue::with_settings(QueueSettings::from_config(
        &config,
    )));
    queue.set_processor(Arc::new(pipeline));

    // First Ctrl-C drains gracefully; a second one abandons in-flight work.
    {
        let queue = Arc::clone(&queue);
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt: finishing in-flight groups (Ctrl-C again to force)");
                interrupt.request_interrupt();
                queue.stop();
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("force stop");
                    queue.force_stop();
                }
            }
        });
    }

    queue.enqueue(groups);
    let results = queue.start().await?;

    worktrees.stop_auto_cleanup();
    let orphans = worktrees.cleanup_orphaned().await;
    if orphans > 0 {
        info!(orphans, "removed orphaned working copies");
    }

    let report = RunReport::from_results(&results);
    print!("{}", report.render());

    Ok(if report.failed > 0 { 1 } else { 0 })
}

pub async fn cleanup(config: Option<PathBuf>, repo: Option<PathBuf>) -> Result<i32> {
    let config = load_config(config.as_ref())?;
    let root = repo_root(repo)?;

    let vcs = Arc::new(GitCli::new(root));
    let worktrees = WorktreeManager::new(vcs, WorktreeSettings::from_config(&config));

    let removed = worktrees.cleanup_orphaned().await;
    println!("removed {removed} orphaned working copies");
    Ok(0)
}
