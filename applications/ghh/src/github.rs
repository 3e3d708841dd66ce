//! Thin REST and GraphQL transport for api.github.com.
//!
//! Every request races the process-wide cancellation token and fails with
//! [`Cancelled`](crate::util::Cancelled) as soon as it fires. Nothing is retried.

use std::{future::Future, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, trace};
use reqwest::{
    header::{ACCEPT, LINK},
    Method, RequestBuilder, Response, StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    project::{ProjectSchema, ResolvedUpdate},
    util::{next_page_link, Cancelled},
};

pub const API_BASE: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const PER_PAGE: u32 = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// See https://docs.github.com/en/rest/actions/workflows#get-a-workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    pub name: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    #[serde(default)]
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub commit: BranchCommit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchCommit {
    pub sha: String,
}

/// `author` is the GitHub account linked to the commit, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub author: Option<User>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub full_name: String,
    pub owner: User,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub default_branch: String,
}

/// See https://docs.github.com/en/rest/branches/branches#sync-a-fork-branch-with-the-upstream-repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeUpstreamResult {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub merge_type: String,
    #[serde(default)]
    pub base_branch: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MergeUpstreamError {
    #[error("the branch could not be synced because of a merge conflict")]
    Conflict,
    #[error("the branch could not be synced for some other reason")]
    Unprocessable,
    #[error("an unknown status code was returned: {0}")]
    UnexpectedStatus(StatusCode),
}

/// Whose namespace a project number is resolved in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    Organization,
    User,
}

impl OwnerKind {
    fn graphql_field(&self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::User => "user",
        }
    }
}

/// See https://docs.github.com/en/graphql/reference/objects#projectv2item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectItem {
    pub id: String,
    pub database_id: u64,
}

#[derive(Deserialize)]
struct GraphqlResponse {
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Deserialize)]
struct WorkflowsPage {
    workflows: Vec<Workflow>,
}

#[derive(Deserialize)]
struct WorkflowRunsPage {
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    token: String,
    api_base: String,
    cancel: CancellationToken,
}

impl std::fmt::Debug for GithubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubClient")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl GithubClient {
    pub fn new(token: impl Into<String>, cancel: CancellationToken) -> Result<Self> {
        Self::with_api_base(API_BASE, token, cancel)
    }

    pub fn with_api_base(
        api_base: impl Into<String>,
        token: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building http client")?;

        Ok(Self {
            http,
            token: token.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            cancel,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .bearer_auth(&self.token)
    }

    /// Drives `fut` unless the cancellation token fires first.
    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Cancelled.into()),
            output = fut => Ok(output),
        }
    }

    async fn send(&self, req: RequestBuilder, url: &str) -> Result<Response> {
        trace!("{url} request: {req:?}");

        let response = self
            .cancellable(req.send())
            .await?
            .context(format!("querying {url}"))?;

        debug!("{url}: {}", response.status());

        Ok(response)
    }

    async fn read_json<T: DeserializeOwned>(&self, response: Response, url: &str) -> Result<T> {
        self.cancellable(response.json::<T>())
            .await?
            .context(format!("decoding response from {url}"))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .send(self.request(Method::GET, url), url)
            .await?
            .error_for_status()?;

        self.read_json(response, url).await
    }

    /// Follows `Link: rel="next"` until the last page and concatenates the items of every page.
    async fn get_all_pages<P, T>(
        &self,
        first_url: String,
        items: impl Fn(P) -> Vec<T>,
    ) -> Result<Vec<T>>
    where
        P: DeserializeOwned,
    {
        let mut all = Vec::new();
        let mut next = Some(first_url);

        while let Some(url) = next {
            let response = self
                .send(self.request(Method::GET, &url), &url)
                .await?
                .error_for_status()?;

            next = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(next_page_link);

            let page: P = self.read_json(response, &url).await?;
            all.extend(items(page));
        }

        Ok(all)
    }

    pub async fn list_workflows(&self, owner: &str, repo: &str) -> Result<Vec<Workflow>> {
        let url = self.url(&format!(
            "/repos/{owner}/{repo}/actions/workflows?per_page={PER_PAGE}"
        ));

        self.get_all_pages(url, |page: WorkflowsPage| page.workflows)
            .await
    }

    pub async fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
        workflow_id: u64,
    ) -> Result<Vec<WorkflowRun>> {
        let url = self.url(&format!(
            "/repos/{owner}/{repo}/actions/workflows/{workflow_id}/runs?per_page={PER_PAGE}"
        ));

        self.get_all_pages(url, |page: WorkflowRunsPage| page.workflow_runs)
            .await
    }

    pub async fn delete_workflow_run(&self, owner: &str, repo: &str, run_id: u64) -> Result<()> {
        let url = self.url(&format!("/repos/{owner}/{repo}/actions/runs/{run_id}"));

        self.send(self.request(Method::DELETE, &url), &url)
            .await?
            .error_for_status()
            .context(format!("deleting workflow run {run_id}"))?;

        Ok(())
    }

    pub async fn authenticated_user(&self) -> Result<User> {
        self.get_json(&self.url("/user")).await
    }

    pub async fn list_branches(
        &self,
        owner: &str,
        repo: &str,
        per_page: u32,
    ) -> Result<Vec<Branch>> {
        let url = self.url(&format!("/repos/{owner}/{repo}/branches?per_page={per_page}"));

        self.get_all_pages(url, |page: Vec<Branch>| page).await
    }

    pub async fn get_commit(&self, owner: &str, repo: &str, sha: &str) -> Result<Commit> {
        self.get_json(&self.url(&format!("/repos/{owner}/{repo}/commits/{sha}")))
            .await
    }

    /// Repositories the authenticated user owns, forks included.
    pub async fn list_owned_repositories(&self) -> Result<Vec<Repository>> {
        let url = self.url(&format!("/user/repos?affiliation=owner&per_page={PER_PAGE}"));

        self.get_all_pages(url, |page: Vec<Repository>| page).await
    }

    pub async fn list_user_forks(&self) -> Result<Vec<Repository>> {
        let repos = self
            .list_owned_repositories()
            .await
            .context("listing user repositories")?;

        Ok(repos.into_iter().filter(|repo| repo.fork).collect())
    }

    /// Like [`Self::url`], but every segment is percent-encoded so that e.g. `#` or `/` in a branch
    /// name stays part of its segment.
    fn segments_url(&self, segments: &[&str]) -> Result<String> {
        let mut url = reqwest::Url::parse(&self.api_base)
            .context(format!("parsing API base {}", self.api_base))?;
        url.path_segments_mut()
            .map_err(|()| anyhow!("API base {} cannot have a path", self.api_base))?
            .pop_if_empty()
            .extend(segments);

        Ok(url.into())
    }

    /// `None` if the branch doesn't exist.
    pub async fn get_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Option<Branch>> {
        let url = self.segments_url(&["repos", owner, repo, "branches", branch])?;
        let response = self.send(self.request(Method::GET, &url), &url).await?;

        match response.status() {
            StatusCode::OK => Ok(Some(self.read_json(response, &url).await?)),
            StatusCode::NOT_FOUND => Ok(None),
            other => bail!("getting branch {branch}: an unknown status code was returned: {other}"),
        }
    }

    pub async fn merge_upstream(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<MergeUpstreamResult> {
        let url = self.url(&format!("/repos/{owner}/{repo}/merge-upstream"));
        let req = self
            .request(Method::POST, &url)
            .json(&json!({ "branch": branch }));
        let response = self.send(req, &url).await?;

        match response.status() {
            StatusCode::OK => self.read_json(response, &url).await,
            StatusCode::CONFLICT => Err(MergeUpstreamError::Conflict.into()),
            StatusCode::UNPROCESSABLE_ENTITY => Err(MergeUpstreamError::Unprocessable.into()),
            other => Err(MergeUpstreamError::UnexpectedStatus(other).into()),
        }
    }

    /// Runs a GraphQL operation and returns its `data`. Any reported error fails the call.
    pub async fn graphql(&self, query: &str, variables: Value) -> Result<Value> {
        let url = self.url("/graphql");
        let req = self
            .request(Method::POST, &url)
            .json(&json!({ "query": query, "variables": variables }));

        let response = self.send(req, &url).await?.error_for_status()?;
        let body: GraphqlResponse = self.read_json(response, &url).await?;

        if !body.errors.is_empty() {
            let messages = body
                .errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            bail!("graphql: {messages}");
        }

        body.data
            .ok_or_else(|| anyhow!("graphql response without data"))
    }

    pub async fn query_user_id(&self, login: &str) -> Result<String> {
        const QUERY: &str = "query($login: String!) { user(login: $login) { id } }";

        let data = self.graphql(QUERY, json!({ "login": login })).await?;

        data.pointer("/user/id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("user {login} not found"))
    }

    pub async fn query_project(
        &self,
        owner: &str,
        owner_kind: OwnerKind,
        number: u64,
    ) -> Result<ProjectSchema> {
        let owner_field = owner_kind.graphql_field();
        let query = format!(
            r#"query($login: String!, $number: Int!) {{
  {owner_field}(login: $login) {{
    projectV2(number: $number) {{
      id
      title
      url
      fields(first: 100) {{
        nodes {{
          __typename
          ... on ProjectV2FieldCommon {{ id name dataType }}
          ... on ProjectV2SingleSelectField {{ options {{ id name }} }}
        }}
      }}
    }}
  }}
}}"#
        );

        let mut data = self
            .graphql(&query, json!({ "login": owner, "number": number }))
            .await?;

        let project = data
            .pointer_mut(&format!("/{owner_field}/projectV2"))
            .map(Value::take)
            .filter(|value| !value.is_null())
            .ok_or_else(|| anyhow!("project {owner}/{number} not found"))?;

        serde_json::from_value(project).context(format!("decoding project {owner}/{number}"))
    }

    pub async fn add_draft_issue(
        &self,
        project_id: &str,
        title: &str,
        body: Option<&str>,
        assignee_ids: &[String],
    ) -> Result<ProjectItem> {
        const MUTATION: &str = "mutation($input: AddProjectV2DraftIssueInput!) { addProjectV2DraftIssue(input: $input) { projectItem { id databaseId } } }";

        let mut input = json!({ "projectId": project_id, "title": title });
        if let Some(body) = body {
            input["body"] = json!(body);
        }
        if !assignee_ids.is_empty() {
            input["assigneeIds"] = json!(assignee_ids);
        }

        let mut data = self.graphql(MUTATION, json!({ "input": input })).await?;
        let item = data
            .pointer_mut("/addProjectV2DraftIssue/projectItem")
            .map(Value::take)
            .ok_or_else(|| anyhow!("draft issue response without project item"))?;

        serde_json::from_value(item).context("decoding project item")
    }

    pub async fn update_item_field_value(
        &self,
        project_id: &str,
        item_id: &str,
        update: &ResolvedUpdate,
    ) -> Result<()> {
        const MUTATION: &str = "mutation($input: UpdateProjectV2ItemFieldValueInput!) { updateProjectV2ItemFieldValue(input: $input) { clientMutationId } }";

        let input = json!({
            "projectId": project_id,
            "itemId": item_id,
            "fieldId": update.field_id,
            "value": update.value,
        });

        self.graphql(MUTATION, json!({ "input": input })).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use mockito::{Matcher, Server};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::{GithubClient, MergeUpstreamError, OwnerKind, Repository};
    use crate::util::is_cancelled;

    fn client(server: &Server) -> GithubClient {
        GithubClient::with_api_base(server.url(), "t", CancellationToken::new()).unwrap()
    }

    fn repo(name: &str, fork: bool) -> serde_json::Value {
        json!({
            "name": name,
            "full_name": format!("someone/{name}"),
            "owner": { "login": "someone", "id": 7 },
            "fork": fork,
            "default_branch": "main"
        })
    }

    #[test]
    fn test_api_base_is_normalized() {
        let client =
            GithubClient::with_api_base("http://localhost:1234/", "t", CancellationToken::new())
                .unwrap();

        assert_eq!(client.url("/user"), "http://localhost:1234/user");
        assert_eq!(OwnerKind::User.graphql_field(), "user");
    }

    #[test]
    fn test_repository_from_rest_payload() {
        let repo: Repository = serde_json::from_value(serde_json::json!({
            "name": "ghh",
            "full_name": "someone/ghh",
            "owner": { "login": "someone", "id": 7 },
            "fork": true,
            "default_branch": "main",
            "private": false
        }))
        .unwrap();

        assert!(repo.fork);
        assert_eq!(repo.owner.login, "someone");
        assert_eq!(repo.default_branch, "main");
    }

    #[test(tokio::test)]
    async fn test_cancelled_client_never_sends() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        // nothing listens on the discard port, so anything but cancellation would be a transport error
        let client = GithubClient::with_api_base("http://127.0.0.1:9", "t", cancel).unwrap();

        let err = client.authenticated_user().await.unwrap_err();
        assert!(is_cancelled(&err), "{err:#}");
    }

    #[test(tokio::test)]
    async fn test_branch_name_is_a_single_path_segment() {
        let mut server = Server::new_async().await;
        let escaped = server
            .mock("GET", "/repos/o/r/branches/feat%231")
            .match_header("authorization", "Bearer t")
            .with_status(200)
            .with_body(r#"{"name": "feat#1", "commit": {"sha": "abc"}}"#)
            .create_async()
            .await;
        let truncated = server
            .mock("GET", "/repos/o/r/branches/feat")
            .with_status(200)
            .with_body(r#"{"name": "feat", "commit": {"sha": "def"}}"#)
            .expect(0)
            .create_async()
            .await;

        let branch = client(&server)
            .get_branch("o", "r", "feat#1")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(branch.name, "feat#1");
        escaped.assert_async().await;
        truncated.assert_async().await;
    }

    #[test(tokio::test)]
    async fn test_missing_branch_is_none() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/repos/o/r/branches/gone")
            .with_status(404)
            .with_body(r#"{"message": "Branch not found"}"#)
            .create_async()
            .await;

        let branch = client(&server).get_branch("o", "r", "gone").await.unwrap();
        assert_eq!(branch, None);
    }

    #[test(tokio::test)]
    async fn test_merge_upstream_statuses() {
        let mut server = Server::new_async().await;
        let _synced = server
            .mock("POST", "/repos/o/synced/merge-upstream")
            .match_body(Matcher::Json(json!({ "branch": "main" })))
            .with_status(200)
            .with_body(
                r#"{"message": "Successfully fetched and fast-forwarded", "merge_type": "fast-forward", "base_branch": "up:main"}"#,
            )
            .create_async()
            .await;
        let _conflict = server
            .mock("POST", "/repos/o/conflict/merge-upstream")
            .with_status(409)
            .create_async()
            .await;
        let _unprocessable = server
            .mock("POST", "/repos/o/unprocessable/merge-upstream")
            .with_status(422)
            .create_async()
            .await;
        let _broken = server
            .mock("POST", "/repos/o/broken/merge-upstream")
            .with_status(500)
            .create_async()
            .await;

        let client = client(&server);

        let result = client.merge_upstream("o", "synced", "main").await.unwrap();
        assert_eq!(result.merge_type, "fast-forward");
        assert_eq!(result.base_branch, "up:main");

        let err = client.merge_upstream("o", "conflict", "main").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MergeUpstreamError>(),
            Some(MergeUpstreamError::Conflict)
        ));

        let err = client
            .merge_upstream("o", "unprocessable", "main")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MergeUpstreamError>(),
            Some(MergeUpstreamError::Unprocessable)
        ));

        let err = client.merge_upstream("o", "broken", "main").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MergeUpstreamError>(),
            Some(MergeUpstreamError::UnexpectedStatus(status)) if status.as_u16() == 500
        ));
    }

    #[test(tokio::test)]
    async fn test_pages_are_followed() {
        let mut server = Server::new_async().await;
        let next = format!("{}/user/7/repos?affiliation=owner&page=2", server.url());
        let link = format!(r#"<{next}>; rel="next""#);

        let first = server
            .mock("GET", Matcher::Regex("^/user/repos".to_string()))
            .with_status(200)
            .with_header("link", link.as_str())
            .with_body(json!([repo("plain", false), repo("fork-a", true)]).to_string())
            .create_async()
            .await;
        let second = server
            .mock("GET", Matcher::Regex("^/user/7/repos".to_string()))
            .with_status(200)
            .with_body(json!([repo("fork-b", true)]).to_string())
            .create_async()
            .await;

        let forks = client(&server).list_user_forks().await.unwrap();

        let names = forks.iter().map(|repo| repo.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["fork-a", "fork-b"]);
        first.assert_async().await;
        second.assert_async().await;
    }

    #[test(tokio::test)]
    async fn test_graphql_errors_and_missing_data() {
        let mut server = Server::new_async().await;
        let _errors = server
            .mock("POST", "/graphql")
            .match_body(Matcher::PartialJson(json!({ "variables": { "login": "ghost" } })))
            .with_status(200)
            .with_body(
                r#"{"data": null, "errors": [{"message": "Could not resolve to a User"}, {"message": "second"}]}"#,
            )
            .create_async()
            .await;
        let _empty = server
            .mock("POST", "/graphql")
            .match_body(Matcher::PartialJson(json!({ "variables": { "login": "empty" } })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        let _found = server
            .mock("POST", "/graphql")
            .match_body(Matcher::PartialJson(json!({ "variables": { "login": "octocat" } })))
            .with_status(200)
            .with_body(r#"{"data": {"user": {"id": "U_1"}}}"#)
            .create_async()
            .await;

        let client = client(&server);

        let err = client.query_user_id("ghost").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "graphql: Could not resolve to a User; second"
        );

        let err = client.query_user_id("empty").await.unwrap_err();
        assert!(err.to_string().contains("without data"), "{err:#}");

        assert_eq!(client.query_user_id("octocat").await.unwrap(), "U_1");
    }
}
