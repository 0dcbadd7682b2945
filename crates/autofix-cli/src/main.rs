mod run;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "autofix", version, about = "Autonomous issue-remediation workflow")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process a manifest of issue groups through the repair pipeline.
    Run(run::RunArgs),
    /// Remove orphaned working copies left behind by earlier runs.
    Cleanup {
        /// Path to autofix.toml (defaults to ./autofix.toml).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Repository root (defaults to the current directory).
        #[arg(long)]
        repo: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    autofix_core::init_tracing();

    let cli = Cli::parse();

    let exit_code = match cli.command {
        Command::Run(args) => run::run(args).await?,
        Command::Cleanup { config, repo } => run::cleanup(config, repo).await?,
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
