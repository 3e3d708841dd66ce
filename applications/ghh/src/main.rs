//! Small helpers around the GitHub REST and GraphQL APIs.
//!
//! Authenticates with a personal access token from `GHH_TOKEN` or the one stored by `ghh set-auth`.
use clap::{Parser, Subcommand};
use log::warn;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use ghh::{
    commands::{self, CreateProjectIssueArgs, SyncForksArgs},
    logger::Logger,
};

#[derive(Parser, Debug)]
#[command(name = "ghh", version)]
#[command(about = "GitHub helper for workflow runs, branches, forks and project issues")]
struct Cli {
    /// Print debug output, including the JSON of everything fetched from GitHub
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Set the GitHub personal access token
    SetAuth,
    /// Delete all runs of a workflow in the current repository
    DeleteAllRuns,
    /// List all branches where the last commit has been pushed by the authenticated user
    ListBranches,
    /// Create a draft issue in a GitHub project and set its fields
    CreateProjectIssue(CreateProjectIssueArgs),
    /// Sync all forks of the authenticated user with their upstream repositories
    SyncForks(SyncForksArgs),
}

async fn wait_for_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = sigterm.recv() => Ok(()),
    }
}

/// The first SIGINT/SIGTERM cancels all in-flight requests, the second one exits right away.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            warn!("couldn't listen for signals: {e}");
            return;
        }
        warn!("interrupted, cancelling. Interrupt again to exit immediately.");
        cancel.cancel();

        if wait_for_signal().await.is_ok() {
            std::process::exit(130);
        }
    });
}

/// Errors are printed as one line with their whole context chain.
fn error_line(e: &anyhow::Error) -> String {
    format!("Error: {e:#}")
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logger = Logger::new(cli.verbose);
    logger.init();

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let result = match cli.command {
        Command::SetAuth => commands::set_auth(),
        Command::DeleteAllRuns => commands::delete_all_runs(cancel).await,
        Command::ListBranches => commands::list_branches(logger, cancel).await,
        Command::CreateProjectIssue(args) => {
            commands::create_project_issue(args, logger, cancel).await
        }
        Command::SyncForks(args) => commands::sync_forks(args, cancel).await,
    };

    if let Err(e) = result {
        eprintln!("{}", error_line(&e));
        std::process::exit(1);
    }
}
