use std::{collections::BTreeMap, path::PathBuf};

use anyhow::{bail, Context, Result};
use log::{debug, info};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{
    forks::{self, Fork, SyncConfig},
    github::{Commit, GithubClient, OwnerKind},
    logger::Logger,
    project::apply_updates,
    settings,
    util::find_owner_and_repo,
};

/// Branches are listed in pages of this size, each one costs an extra commit lookup.
const BRANCHES_PER_PAGE: u32 = 50;

#[derive(Debug, clap::Args)]
pub struct CreateProjectIssueArgs {
    /// Path to the JSON metadata file
    #[arg(long)]
    pub metadata: PathBuf,

    /// Path to a file containing the issue body
    #[arg(long)]
    pub body: Option<PathBuf>,

    /// Look the project up under a user login instead of an organization
    #[arg(long)]
    pub user_owned: bool,
}

#[derive(Debug, clap::Args)]
pub struct SyncForksArgs {
    /// Target branches to sync, the first one existing on a fork is used. If empty, the default branch of the fork will be used.
    #[arg(short, long, value_delimiter = ',')]
    pub target_branches: Vec<String>,

    /// Repositories to ignore
    #[arg(short, long, value_delimiter = ',')]
    pub ignore_repos: Vec<String>,

    /// Don't target the default branch of the fork. '--target-branches' must be set. If none of the target branches exist, the repo will not be synced.
    #[arg(long)]
    pub dont_target_default: bool,
}

/// Contents of the `--metadata` file of `create-project-issue`.
///
/// Example:
/// `{"Organization": "acme", "ProjectNumber": 3, "IssueTitle": "Bug", "Assignees": ["octocat"], "Fields": {"Status": "Done"}}`
#[derive(Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Metadata {
    pub organization: String,
    pub project_number: u64,
    pub issue_title: String,
    pub assignees: Vec<String>,
    pub fields: BTreeMap<String, String>,
}

impl Metadata {
    pub fn parse(raw: &str) -> Result<Self> {
        let metadata: Self = serde_json::from_str(raw).context("parsing metadata as JSON")?;

        if metadata.organization.is_empty() {
            bail!("validating metadata fields: organization is required");
        }
        if metadata.project_number == 0 {
            bail!("validating metadata fields: project number is required");
        }

        Ok(metadata)
    }
}

pub fn set_auth() -> Result<()> {
    let token = match std::env::var(settings::TOKEN_ENV_KEY) {
        Ok(token) if !token.is_empty() => token,
        _ => settings::read_token_interactively()?,
    };

    let path = settings::settings_path()?;
    settings::save_token(&path, &token)?;

    println!("Successfully saved token.");
    Ok(())
}

pub async fn delete_all_runs(cancel: CancellationToken) -> Result<()> {
    let (owner, repo) = find_owner_and_repo().context("get current repository")?;
    let token = settings::get_token().context("get personal access token")?;
    let client = GithubClient::new(token, cancel)?;

    let workflows = client
        .list_workflows(&owner, &repo)
        .await
        .context("listing workflows")?;
    if workflows.is_empty() {
        bail!("no workflows found in {owner}/{repo}");
    }

    let names = workflows
        .iter()
        .map(|workflow| workflow.name.as_str())
        .collect::<Vec<_>>();
    let selected = dialoguer::Select::new()
        .with_prompt("Select workflow")
        .items(&names)
        .default(0)
        .interact()
        .context("selecting workflow")?;
    let workflow = &workflows[selected];

    let runs = client
        .list_workflow_runs(&owner, &repo, workflow.id)
        .await
        .context(format!("listing runs of {}", workflow.name))?;

    println!("Deleting {} runs...", runs.len());
    for run in &runs {
        debug!("deleting run {}", run.id);
        client.delete_workflow_run(&owner, &repo, run.id).await?;
    }

    println!("Done.");
    Ok(())
}

fn is_authored_by(commit: &Commit, login: &str) -> bool {
    commit
        .author
        .as_ref()
        .is_some_and(|author| author.login == login)
}

pub async fn list_branches(logger: Logger, cancel: CancellationToken) -> Result<()> {
    let (owner, repo) = find_owner_and_repo().context("get current repository")?;
    let token = settings::get_token().context("get personal access token")?;
    let client = GithubClient::new(token, cancel)?;

    let user = client.authenticated_user().await.context("get user")?;
    logger.print_json("user", &user);

    let mut branches = Vec::new();
    for branch in client
        .list_branches(&owner, &repo, BRANCHES_PER_PAGE)
        .await
        .context("get branches")?
    {
        let commit = client
            .get_commit(&owner, &repo, &branch.commit.sha)
            .await
            .context(format!("get commit of branch {}", branch.name))?;

        if is_authored_by(&commit, &user.login) {
            branches.push(branch);
        }
    }
    logger.print_json("branches", &branches);

    if branches.is_empty() {
        println!("No branches found");
        return Ok(());
    }

    println!("Your branches:");
    for branch in &branches {
        println!("\t{} - {}", branch.name, branch.commit.sha);
    }

    Ok(())
}

pub async fn create_project_issue(
    args: CreateProjectIssueArgs,
    logger: Logger,
    cancel: CancellationToken,
) -> Result<()> {
    let metadata = std::fs::read_to_string(&args.metadata)
        .context(format!("reading metadata from {:?}", args.metadata))?;
    let metadata = Metadata::parse(&metadata)?;

    let body = match &args.body {
        Some(path) => {
            std::fs::read_to_string(path).context(format!("reading body from {path:?}"))?
        }
        None => String::new(),
    };

    let token = settings::get_token().context("getting token")?;
    let client = GithubClient::new(token, cancel)?;

    let owner_kind = if args.user_owned {
        OwnerKind::User
    } else {
        OwnerKind::Organization
    };

    debug!(
        "searching project {}/{}",
        metadata.organization, metadata.project_number
    );
    let project = client
        .query_project(&metadata.organization, owner_kind, metadata.project_number)
        .await
        .context("querying project")?;
    logger.print_json("found project", &project);

    let mut assignee_ids = Vec::with_capacity(metadata.assignees.len());
    for assignee in &metadata.assignees {
        debug!("searching user {assignee}");
        let id = client
            .query_user_id(assignee)
            .await
            .context("querying user")?;
        logger.print_json("found user", &id);
        assignee_ids.push(id);
    }

    let item = client
        .add_draft_issue(
            &project.id,
            &metadata.issue_title,
            (!body.is_empty()).then_some(body.as_str()),
            &assignee_ids,
        )
        .await
        .context("adding project issue")?;

    let (client, project_id, item_id) = (&client, project.id.as_str(), item.id.as_str());
    apply_updates(&project, &metadata.fields, logger, move |update| async move {
        client
            .update_item_field_value(project_id, item_id, &update)
            .await
    })
    .await
    .context("updating project issue fields")?;

    info!("created project issue:");
    println!("{}", project.item_url(item.database_id));

    Ok(())
}

pub async fn sync_forks(args: SyncForksArgs, cancel: CancellationToken) -> Result<()> {
    let config = SyncConfig::new(args.target_branches, args.dont_target_default)?;

    let token = settings::get_token().context("getting token")?;
    let client = GithubClient::new(token, cancel)?;

    debug!("listing forks");
    let forks = client
        .list_user_forks()
        .await
        .context("listing forks")?
        .into_iter()
        .map(Fork::from)
        .collect::<Vec<_>>();

    for fork in &forks {
        debug!("discovered fork {}", fork.full_name);
    }
    debug!("{} forks found", forks.len());

    let forks = forks::filter_ignored(forks, &args.ignore_repos);
    debug!("{} remaining after filtering", forks.len());

    forks::sync_all(&client, &forks, &config)
        .await?
        .into_result()
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use std::collections::BTreeMap;

    use super::{is_authored_by, Metadata};
    use crate::github::{Commit, User};

    #[test]
    fn test_parse_metadata() {
        let metadata = Metadata::parse(
            r#"{"Organization": "acme", "ProjectNumber": 3, "IssueTitle": "Bug", "Fields": {"Status": "Done"}}"#,
        )
        .unwrap();

        assert_eq!(
            metadata,
            Metadata {
                organization: "acme".to_string(),
                project_number: 3,
                issue_title: "Bug".to_string(),
                assignees: vec![],
                fields: BTreeMap::from([("Status".to_string(), "Done".to_string())]),
            }
        );
    }

    #[test]
    fn test_parse_metadata_requires_owner_and_number() {
        let err = Metadata::parse(r#"{"ProjectNumber": 3}"#).unwrap_err();
        assert!(err.to_string().contains("organization is required"), "{err}");

        let err = Metadata::parse(r#"{"Organization": "acme"}"#).unwrap_err();
        assert!(err.to_string().contains("project number is required"), "{err}");

        let err = Metadata::parse("{").unwrap_err();
        assert!(err.to_string().contains("parsing metadata"), "{err}");
    }

    #[test]
    fn test_is_authored_by() {
        let commit = |author: Option<&str>| Commit {
            sha: "abc".to_string(),
            author: author.map(|login| User {
                login: login.to_string(),
                id: 1,
            }),
        };

        assert!(is_authored_by(&commit(Some("octocat")), "octocat"));
        assert!(!is_authored_by(&commit(Some("hubot")), "octocat"));
        assert!(!is_authored_by(&commit(None), "octocat"));
    }
}
