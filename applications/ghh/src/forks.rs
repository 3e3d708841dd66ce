//! Syncing the authenticated user's forks with their upstream repositories.
//!
//! Forks are processed one after another. A failing fork is recorded and the batch moves on,
//! only cancellation aborts the whole run.

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};

use crate::{
    github::{GithubClient, MergeUpstreamResult, Repository},
    util::is_cancelled,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fork {
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub default_branch: String,
}

impl From<Repository> for Fork {
    fn from(repo: Repository) -> Self {
        Self {
            owner: repo.owner.login,
            name: repo.name,
            full_name: repo.full_name,
            default_branch: repo.default_branch,
        }
    }
}

/// Which branch of each fork gets synced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Checked in order, the first one that exists on the fork wins.
    pub target_branches: Vec<String>,
    /// Fall back to the fork's default branch when none of `target_branches` exist.
    pub use_default_branch: bool,
}

impl SyncConfig {
    pub fn new(target_branches: Vec<String>, dont_target_default: bool) -> Result<Self> {
        if dont_target_default && target_branches.is_empty() {
            bail!("'--target-branches' must be set when using '--dont-target-default'");
        }

        Ok(Self {
            target_branches,
            use_default_branch: !dont_target_default,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkOutcome {
    FastForward,
    Merge,
    UpToDate,
    Skipped,
    Failed(String),
}

impl ForkOutcome {
    /// Maps the `merge_type` of a successful merge-upstream call.
    pub fn from_merge_type(merge_type: &str) -> Self {
        match merge_type {
            "fast-forward" => Self::FastForward,
            "merge" => Self::Merge,
            "none" => Self::UpToDate,
            other => Self::Failed(format!("unknown merge type {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkDecision {
    pub fork: Fork,
    pub target_branch: Option<String>,
    pub outcome: ForkOutcome,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub total: usize,
    pub fast_forwarded: usize,
    pub merged: usize,
    pub up_to_date: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<String>,
}

impl SyncSummary {
    pub fn record(&mut self, decision: &ForkDecision) {
        self.total += 1;

        match &decision.outcome {
            ForkOutcome::FastForward => self.fast_forwarded += 1,
            ForkOutcome::Merge => self.merged += 1,
            ForkOutcome::UpToDate => self.up_to_date += 1,
            ForkOutcome::Skipped => self.skipped += 1,
            ForkOutcome::Failed(reason) => {
                self.failed += 1;
                self.failures
                    .push(format!("syncing fork {}: {reason}", decision.fork.full_name));
            }
        }
    }

    pub fn log(&self) {
        info!(
            "synced {} forks: {} up-to-date, {} fast-forwarded, {} merged, {} skipped, {} failed",
            self.total,
            self.up_to_date,
            self.fast_forwarded,
            self.merged,
            self.skipped,
            self.failed,
        );
    }

    /// Joins the per-fork failures into a single error.
    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            return Ok(());
        }

        bail!("{}", self.failures.join("\n"))
    }
}

/// What the sync flow needs from GitHub.
#[allow(async_fn_in_trait)]
pub trait ForkRemote {
    async fn branch_exists(&self, fork: &Fork, branch: &str) -> Result<bool>;
    async fn merge_upstream(&self, fork: &Fork, branch: &str) -> Result<MergeUpstreamResult>;
}

impl ForkRemote for GithubClient {
    async fn branch_exists(&self, fork: &Fork, branch: &str) -> Result<bool> {
        let found = self.get_branch(&fork.owner, &fork.name, branch).await?;
        Ok(found.is_some())
    }

    async fn merge_upstream(&self, fork: &Fork, branch: &str) -> Result<MergeUpstreamResult> {
        GithubClient::merge_upstream(self, &fork.owner, &fork.name, branch)
            .await
            .context("merging upstream into fork")
    }
}

/// Drops forks whose name case-insensitively equals an entry of `ignore`.
pub fn filter_ignored(forks: Vec<Fork>, ignore: &[String]) -> Vec<Fork> {
    forks
        .into_iter()
        .filter(|fork| {
            !ignore
                .iter()
                .any(|ignored| fork.name.eq_ignore_ascii_case(ignored))
        })
        .collect()
}

/// The first existing target branch, else the default branch if allowed, else `None`.
pub async fn select_branch<R: ForkRemote>(
    remote: &R,
    fork: &Fork,
    config: &SyncConfig,
) -> Result<Option<String>> {
    let mut branch = None;
    if config.use_default_branch && !fork.default_branch.is_empty() {
        debug!("{}: default branch is {}", fork.full_name, fork.default_branch);
        branch = Some(fork.default_branch.clone());
    }

    for target in &config.target_branches {
        debug!("{}: checking if branch {target:?} exists", fork.full_name);

        match remote.branch_exists(fork, target).await {
            Ok(true) => {
                debug!("{}: using target branch {target:?}", fork.full_name);
                branch = Some(target.clone());
                break;
            }
            Ok(false) => {}
            Err(e) if is_cancelled(&e) => return Err(e),
            Err(e) => warn!("{}: looking up branch {target:?}: {e:#}", fork.full_name),
        }
    }

    Ok(branch)
}

/// Only returns an error when cancelled, every other failure ends up in the outcome.
pub async fn sync_fork<R: ForkRemote>(
    remote: &R,
    fork: &Fork,
    config: &SyncConfig,
) -> Result<ForkDecision> {
    let target_branch = select_branch(remote, fork, config).await?;

    let Some(branch) = target_branch else {
        warn!("{}: no target branch found, skipping", fork.full_name);
        return Ok(ForkDecision {
            fork: fork.clone(),
            target_branch: None,
            outcome: ForkOutcome::Skipped,
        });
    };

    info!("{}: syncing fork branch {branch:?} with upstream", fork.full_name);

    let outcome = match remote.merge_upstream(fork, &branch).await {
        Ok(result) => {
            info!("synced fork {}: {}", fork.full_name, result.message);
            ForkOutcome::from_merge_type(&result.merge_type)
        }
        Err(e) if is_cancelled(&e) => return Err(e),
        Err(e) => {
            error!("{}: syncing fork: {e:#}", fork.full_name);
            ForkOutcome::Failed(format!("{e:#}"))
        }
    };

    Ok(ForkDecision {
        fork: fork.clone(),
        target_branch: Some(branch),
        outcome,
    })
}

/// Syncs every fork in order. The summary is logged even when cancellation cuts the run short.
pub async fn sync_all<R: ForkRemote>(
    remote: &R,
    forks: &[Fork],
    config: &SyncConfig,
) -> Result<SyncSummary> {
    let mut summary = SyncSummary::default();

    for fork in forks {
        match sync_fork(remote, fork, config).await {
            Ok(decision) => summary.record(&decision),
            Err(e) => {
                summary.log();
                return Err(e).context(format!("syncing fork {}", fork.full_name));
            }
        }
    }

    summary.log();

    Ok(summary)
}
