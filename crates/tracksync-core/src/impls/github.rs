//! GitHubGateway - GitHub Issues + Projects (v2) への RemoteGateway 実装
//!
//! - Issue の CRUD は REST (`/repos/{owner}/{repo}/issues`)
//! - milestone はタイトルで指定し、番号はここで解決（無ければ作成）
//! - board は Projects v2 の GraphQL。カラムは単一選択フィールド `Status`
//! - `project_number` が無く `project_name` だけのときはタイトルで探し、
//!   最初の board 操作で作成する（一覧取得では作らない）
//!
//! HTTP 429 / 5xx / レート制限の 403 / 通信エラーは `SyncError::Transient`、
//! それ以外の 4xx は `SyncError::Permanent` に変換します。リトライ自体は
//! executor の `RetryPolicy` に任せます。

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::config::Config;
use crate::domain::{IssueDraft, IssueNumber, IssuePatch, RemoteIssue, Status, SyncError};
use crate::ports::RemoteGateway;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const TOKEN_ENV: &str = "GITHUB_TOKEN";
const USER_AGENT: &str = "tracksync";
const PER_PAGE: usize = 100;

const PROJECT_QUERY: &str = r#"
query($owner: String!, $number: Int!, $cursor: String) {
  repositoryOwner(login: $owner) {
    ... on User { projectV2(number: $number) { ...Board } }
    ... on Organization { projectV2(number: $number) { ...Board } }
  }
}
fragment Board on ProjectV2 {
  id
  field(name: "Status") {
    ... on ProjectV2SingleSelectField { id options { id name } }
  }
  items(first: 100, after: $cursor) {
    pageInfo { hasNextPage endCursor }
    nodes {
      id
      content { ... on Issue { number repository { nameWithOwner } } }
      fieldValueByName(name: "Status") {
        ... on ProjectV2ItemFieldSingleSelectValue { name }
      }
    }
  }
}
"#;

const OWNER_PROJECTS_QUERY: &str = r#"
query($owner: String!, $title: String!) {
  repositoryOwner(login: $owner) {
    id
    ... on User { projectsV2(first: 100, query: $title) { nodes { number title } } }
    ... on Organization { projectsV2(first: 100, query: $title) { nodes { number title } } }
  }
}
"#;

const CREATE_PROJECT_MUTATION: &str = r#"
mutation($owner: ID!, $title: String!) {
  createProjectV2(input: { ownerId: $owner, title: $title }) {
    projectV2 { id number url }
  }
}
"#;

const ADD_ITEM_MUTATION: &str = r#"
mutation($project: ID!, $content: ID!) {
  addProjectV2ItemById(input: { projectId: $project, contentId: $content }) {
    item { id }
  }
}
"#;

const SET_STATUS_MUTATION: &str = r#"
mutation($project: ID!, $item: ID!, $field: ID!, $option: String!) {
  updateProjectV2ItemFieldValue(input: {
    projectId: $project, itemId: $item, fieldId: $field,
    value: { singleSelectOptionId: $option }
  }) {
    projectV2Item { id }
  }
}
"#;

// ---- REST payloads ----

#[derive(Debug, Deserialize)]
struct IssueJson {
    number: u64,
    node_id: String,
    title: String,
    state: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<NamedJson>,
    #[serde(default)]
    milestone: Option<MilestoneJson>,
    #[serde(default)]
    pull_request: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct NamedJson {
    name: String,
}

#[derive(Debug, Deserialize)]
struct MilestoneJson {
    number: u64,
    title: String,
}

impl IssueJson {
    fn into_remote(self) -> Result<RemoteIssue, SyncError> {
        let status = Status::from_remote_state(&self.state).ok_or_else(|| {
            SyncError::Permanent(format!("issue #{}: unknown state `{}`", self.number, self.state))
        })?;
        let mut issue = RemoteIssue::new(IssueNumber::new(self.number), self.title);
        issue.status = status;
        issue.labels = self.labels.into_iter().map(|l| l.name).collect();
        issue.milestone = self.milestone.map(|m| m.title);
        issue.body = self.body.unwrap_or_default();
        Ok(issue)
    }
}

// ---- GraphQL payloads ----

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnerData {
    repository_owner: Option<OwnerNode>,
}

#[derive(Debug, Deserialize)]
struct OwnerNode {
    #[serde(rename = "projectV2")]
    project: Option<ProjectNode>,
}

#[derive(Debug, Deserialize)]
struct ProjectNode {
    id: String,
    field: Option<StatusFieldNode>,
    items: ItemConnection,
}

#[derive(Debug, Deserialize)]
struct StatusFieldNode {
    id: Option<String>,
    #[serde(default)]
    options: Vec<OptionNode>,
}

#[derive(Debug, Deserialize)]
struct OptionNode {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemConnection {
    page_info: PageInfo,
    nodes: Vec<ItemNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemNode {
    id: String,
    content: Option<ItemContent>,
    field_value_by_name: Option<ColumnValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemContent {
    number: Option<u64>,
    repository: Option<RepositoryRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryRef {
    name_with_owner: String,
}

#[derive(Debug, Deserialize)]
struct ColumnValue {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnerProjectsData {
    repository_owner: Option<OwnerProjects>,
}

#[derive(Debug, Deserialize)]
struct OwnerProjects {
    id: String,
    #[serde(rename = "projectsV2")]
    projects: Option<ProjectList>,
}

#[derive(Debug, Deserialize)]
struct ProjectList {
    #[serde(default)]
    nodes: Vec<ProjectSummary>,
}

#[derive(Debug, Deserialize)]
struct ProjectSummary {
    number: u64,
    title: String,
}

impl OwnerProjects {
    /// The search is fuzzy; only an exact title counts. Oldest project wins.
    fn numbered(&self, title: &str) -> Option<u64> {
        self.projects
            .iter()
            .flat_map(|list| &list.nodes)
            .filter(|p| p.title == title)
            .map(|p| p.number)
            .min()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectData {
    create_project_v2: CreatedProject,
}

#[derive(Debug, Deserialize)]
struct CreatedProject {
    #[serde(rename = "projectV2")]
    project: CreatedProjectNode,
}

#[derive(Debug, Deserialize)]
struct CreatedProjectNode {
    number: u64,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddItemData {
    add_project_v2_item_by_id: AddItemPayload,
}

#[derive(Debug, Deserialize)]
struct AddItemPayload {
    item: ItemId,
}

#[derive(Debug, Deserialize)]
struct ItemId {
    id: String,
}

/// Board metadata, fetched once per run.
#[derive(Debug, Clone)]
struct Board {
    project_id: String,
    status_field: Option<String>,
    /// Column name → single-select option id.
    options: BTreeMap<String, String>,
}

/// A board item as of the last listing.
#[derive(Debug, Clone)]
struct BoardItem {
    item_id: String,
    column: Option<String>,
}

pub struct GitHubGateway {
    client: Client,
    api_base: String,
    owner: String,
    repo: String,
    token: String,
    project_number: Option<u64>,
    project_name: Option<String>,
    /// Project number once known, configured or resolved by title.
    project: OnceCell<u64>,
    board: OnceCell<Board>,
    items: Mutex<BTreeMap<IssueNumber, BoardItem>>,
    node_ids: Mutex<BTreeMap<IssueNumber, String>>,
    milestones: Mutex<Option<BTreeMap<String, u64>>>,
}

impl GitHubGateway {
    pub fn new(config: &Config, token: impl Into<String>) -> Result<Self, SyncError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(SyncError::config(TOKEN_ENV, "must not be empty"));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SyncError::config("http client", e.to_string()))?;
        Ok(Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            owner: config.repo_owner.clone(),
            repo: config.repo_name.clone(),
            token,
            project_number: config.project_number,
            project_name: config.project_name.clone(),
            project: OnceCell::new(),
            board: OnceCell::new(),
            items: Mutex::new(BTreeMap::new()),
            node_ids: Mutex::new(BTreeMap::new()),
            milestones: Mutex::new(None),
        })
    }

    /// Token from `GITHUB_TOKEN`.
    pub fn from_env(config: &Config) -> Result<Self, SyncError> {
        let token = std::env::var(TOKEN_ENV)
            .map_err(|_| SyncError::config(TOKEN_ENV, "environment variable is not set"))?;
        Self::new(config, token)
    }

    /// GitHub Enterprise or a test server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}{path}", self.api_base, self.owner, self.repo)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .bearer_auth(&self.token)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SyncError> {
        let response = self.authorized(request).send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read response body".to_string());
            return Err(status_error(status, &headers, &body));
        }
        response.json().await.map_err(transport_error)
    }

    async fn graphql<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T, SyncError> {
        let request = self
            .client
            .post(format!("{}/graphql", self.api_base))
            .json(&json!({ "query": query, "variables": variables }));
        let response: GraphQlResponse<T> = self.send(request).await?;
        graphql_data(response)
    }

    fn cache_node_id(node_ids: &mut BTreeMap<IssueNumber, String>, issue: &IssueJson) {
        node_ids.insert(IssueNumber::new(issue.number), issue.node_id.clone());
    }

    async fn node_id(&self, number: IssueNumber) -> Result<String, SyncError> {
        if let Some(id) = self.node_ids.lock().await.get(&number) {
            return Ok(id.clone());
        }
        let issue: IssueJson = self
            .send(self.client.get(self.repo_url(&format!("/issues/{}", number.get()))))
            .await?;
        let id = issue.node_id.clone();
        Self::cache_node_id(&mut *self.node_ids.lock().await, &issue);
        Ok(id)
    }

    /// GET every page of a repository listing (`state=all`).
    async fn list_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, SyncError> {
        let mut all = Vec::new();
        for page in 1.. {
            let batch: Vec<T> = self
                .send(self.client.get(self.repo_url(path)).query(&[
                    ("state", "all".to_string()),
                    ("per_page", PER_PAGE.to_string()),
                    ("page", page.to_string()),
                ]))
                .await?;
            let done = batch.len() < PER_PAGE;
            all.extend(batch);
            if done {
                break;
            }
        }
        Ok(all)
    }

    async fn milestone_number(&self, title: &str) -> Result<u64, SyncError> {
        let mut cache = self.milestones.lock().await;
        if cache.is_none() {
            let listed: Vec<MilestoneJson> = self.list_all("/milestones").await?;
            debug!("listed {} milestones", listed.len());
            *cache = Some(listed.into_iter().map(|m| (m.title, m.number)).collect());
        }
        let known = cache.get_or_insert_with(BTreeMap::new);
        if let Some(number) = known.get(title) {
            return Ok(*number);
        }
        let created: MilestoneJson = self
            .send(
                self.client
                    .post(self.repo_url("/milestones"))
                    .json(&json!({ "title": title })),
            )
            .await?;
        info!("created milestone `{title}`");
        known.insert(created.title, created.number);
        Ok(created.number)
    }

    /// Configured project number, or the owner's project titled
    /// `project_name`. `None` when neither resolves. Never creates.
    async fn find_project(&self) -> Result<Option<u64>, SyncError> {
        if let Some(number) = self.project.get() {
            return Ok(Some(*number));
        }
        if let Some(number) = self.project_number {
            let _ = self.project.set(number);
            return Ok(Some(number));
        }
        let Some(title) = &self.project_name else {
            return Ok(None);
        };
        let owner = self.owner_projects(title).await?;
        let found = owner.numbered(title);
        if let Some(number) = found {
            debug!("project `{title}` is #{number}");
            let _ = self.project.set(number);
        }
        Ok(found)
    }

    /// Like `find_project`, but creates the `project_name` board when missing.
    async fn ensure_project(&self) -> Result<u64, SyncError> {
        if let Some(number) = self.find_project().await? {
            return Ok(number);
        }
        let title = self.project_name.as_deref().ok_or_else(|| {
            SyncError::config("project_number", "board operations need a project")
        })?;
        let number = *self
            .project
            .get_or_try_init(|| self.create_project(title))
            .await?;
        Ok(number)
    }

    async fn owner_projects(&self, title: &str) -> Result<OwnerProjects, SyncError> {
        let data: OwnerProjectsData = self
            .graphql(
                OWNER_PROJECTS_QUERY,
                json!({ "owner": self.owner, "title": title }),
            )
            .await?;
        data.repository_owner.ok_or_else(|| {
            SyncError::config("repo_owner", format!("`{}` is not a user or organization", self.owner))
        })
    }

    async fn create_project(&self, title: &str) -> Result<u64, SyncError> {
        // Someone may have created it since the lookup.
        let owner = self.owner_projects(title).await?;
        if let Some(number) = owner.numbered(title) {
            return Ok(number);
        }
        let data: CreateProjectData = self
            .graphql(
                CREATE_PROJECT_MUTATION,
                json!({ "owner": owner.id, "title": title }),
            )
            .await?;
        let project = data.create_project_v2.project;
        info!(
            "created project `{title}` (#{}) {}",
            project.number,
            project.url.as_deref().unwrap_or_default()
        );
        Ok(project.number)
    }

    /// Page through the board, refreshing the item cache. Returns board metadata.
    async fn fetch_board(&self, number: u64) -> Result<Board, SyncError> {
        let repo = format!("{}/{}", self.owner, self.repo).to_lowercase();
        let mut cursor: Option<String> = None;
        let mut board: Option<Board> = None;
        let mut items = BTreeMap::new();
        loop {
            let data: OwnerData = self
                .graphql(
                    PROJECT_QUERY,
                    json!({ "owner": self.owner, "number": number, "cursor": cursor }),
                )
                .await?;
            let project = data
                .repository_owner
                .and_then(|owner| owner.project)
                .ok_or_else(|| {
                    SyncError::config(
                        "project_number",
                        format!("project #{number} not found for {}", self.owner),
                    )
                })?;
            if board.is_none() {
                let (status_field, options) = match project.field {
                    Some(StatusFieldNode { id: Some(id), options }) => (
                        Some(id),
                        options.into_iter().map(|o| (o.name, o.id)).collect(),
                    ),
                    _ => (None, BTreeMap::new()),
                };
                board = Some(Board {
                    project_id: project.id.clone(),
                    status_field,
                    options,
                });
            }
            for node in project.items.nodes {
                let Some(content) = node.content else { continue };
                let (Some(number), Some(repository)) = (content.number, content.repository) else {
                    continue;
                };
                if repository.name_with_owner.to_lowercase() != repo {
                    continue;
                }
                items.insert(
                    IssueNumber::new(number),
                    BoardItem {
                        item_id: node.id,
                        column: node.field_value_by_name.and_then(|v| v.name),
                    },
                );
            }
            if !project.items.page_info.has_next_page {
                break;
            }
            cursor = project.items.page_info.end_cursor;
        }
        *self.items.lock().await = items;
        board.ok_or_else(|| SyncError::Permanent("empty project response".into()))
    }

    async fn board(&self) -> Result<&Board, SyncError> {
        self.board
            .get_or_try_init(|| async {
                let number = self.ensure_project().await?;
                self.fetch_board(number).await
            })
            .await
    }
}

#[async_trait]
impl RemoteGateway for GitHubGateway {
    async fn list_issues(&self) -> Result<Vec<RemoteIssue>, SyncError> {
        let listed: Vec<IssueJson> = self.list_all("/issues").await?;
        let mut issues = Vec::new();
        let mut node_ids = BTreeMap::new();
        for issue in listed {
            if issue.pull_request.is_some() {
                continue;
            }
            Self::cache_node_id(&mut node_ids, &issue);
            issues.push(issue.into_remote()?);
        }
        *self.node_ids.lock().await = node_ids;
        debug!("listed {} issues", issues.len());

        match self.find_project().await? {
            Some(number) => {
                let board = self.fetch_board(number).await?;
                // Keep the first fetch's metadata; items were refreshed above.
                let _ = self.board.set(board);
                let items = self.items.lock().await;
                for issue in &mut issues {
                    if let Some(item) = items.get(&issue.number) {
                        issue.on_board = true;
                        issue.board_column = item.column.clone();
                    }
                }
            }
            None => {
                if let Some(title) = &self.project_name {
                    info!("project `{title}` does not exist yet; it is created on first use");
                }
            }
        }
        Ok(issues)
    }

    async fn create_issue(&self, draft: &IssueDraft) -> Result<IssueNumber, SyncError> {
        let mut payload = json!({
            "title": draft.title,
            "body": draft.body,
            "labels": draft.labels,
        });
        if let Some(title) = &draft.milestone {
            payload["milestone"] = json!(self.milestone_number(title).await?);
        }
        let created: IssueJson = self
            .send(self.client.post(self.repo_url("/issues")).json(&payload))
            .await?;
        let number = IssueNumber::new(created.number);
        Self::cache_node_id(&mut *self.node_ids.lock().await, &created);
        Ok(number)
    }

    async fn update_issue(&self, number: IssueNumber, patch: &IssuePatch) -> Result<(), SyncError> {
        let milestone = match &patch.milestone {
            Some(Some(title)) => Some(Some(self.milestone_number(title).await?)),
            Some(None) => Some(None),
            None => None,
        };
        let payload = patch_payload(patch, milestone);
        let _: IssueJson = self
            .send(
                self.client
                    .patch(self.repo_url(&format!("/issues/{}", number.get())))
                    .json(&payload),
            )
            .await?;
        Ok(())
    }

    async fn close_issue(&self, number: IssueNumber) -> Result<(), SyncError> {
        let _: IssueJson = self
            .send(
                self.client
                    .patch(self.repo_url(&format!("/issues/{}", number.get())))
                    .json(&json!({ "state": "closed" })),
            )
            .await?;
        Ok(())
    }

    async fn reopen_issue(&self, number: IssueNumber) -> Result<(), SyncError> {
        let _: IssueJson = self
            .send(
                self.client
                    .patch(self.repo_url(&format!("/issues/{}", number.get())))
                    .json(&json!({ "state": "open" })),
            )
            .await?;
        Ok(())
    }

    async fn add_to_board(&self, number: IssueNumber) -> Result<(), SyncError> {
        let board = self.board().await?;
        if self.items.lock().await.contains_key(&number) {
            return Ok(());
        }
        let content = self.node_id(number).await?;
        let data: AddItemData = self
            .graphql(
                ADD_ITEM_MUTATION,
                json!({ "project": board.project_id, "content": content }),
            )
            .await?;
        self.items.lock().await.insert(
            number,
            BoardItem {
                item_id: data.add_project_v2_item_by_id.item.id,
                column: None,
            },
        );
        Ok(())
    }

    async fn move_column(&self, number: IssueNumber, column: &str) -> Result<(), SyncError> {
        let board = self.board().await?;
        let field = board.status_field.as_ref().ok_or_else(|| {
            SyncError::Permanent("project has no single-select `Status` field".into())
        })?;
        let option = board.options.get(column).ok_or_else(|| {
            SyncError::Permanent(format!("project has no `{column}` column"))
        })?;
        let item = self
            .items
            .lock()
            .await
            .get(&number)
            .map(|item| item.item_id.clone())
            .ok_or_else(|| SyncError::Permanent(format!("{number} is not on the board")))?;
        let _: Value = self
            .graphql(
                SET_STATUS_MUTATION,
                json!({
                    "project": board.project_id,
                    "item": item,
                    "field": field,
                    "option": option,
                }),
            )
            .await?;
        if let Some(entry) = self.items.lock().await.get_mut(&number) {
            entry.column = Some(column.to_string());
        }
        Ok(())
    }
}

/// REST body for an issue update. `milestone` is already resolved to a number.
fn patch_payload(patch: &IssuePatch, milestone: Option<Option<u64>>) -> Value {
    let mut payload = json!({});
    if let Some(title) = &patch.title {
        payload["title"] = json!(title);
    }
    if let Some(labels) = &patch.labels {
        payload["labels"] = json!(labels);
    }
    if let Some(body) = &patch.body {
        payload["body"] = json!(body);
    }
    if let Some(milestone) = milestone {
        payload["milestone"] = json!(milestone);
    }
    payload
}

fn transport_error(err: reqwest::Error) -> SyncError {
    if err.is_decode() {
        SyncError::Permanent(format!("unexpected response: {err}"))
    } else {
        SyncError::Transient(err.to_string())
    }
}

fn status_error(status: StatusCode, headers: &HeaderMap, body: &str) -> SyncError {
    let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN
            && (headers
                .get("x-ratelimit-remaining")
                .is_some_and(|v| v.as_bytes() == b"0")
                || body.contains("rate limit")));
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if rate_limited || status.is_server_error() {
        SyncError::Transient(message)
    } else {
        SyncError::Permanent(message)
    }
}

fn graphql_data<T>(response: GraphQlResponse<T>) -> Result<T, SyncError> {
    if !response.errors.is_empty() {
        let messages: Vec<String> = response.errors.into_iter().map(|e| e.message).collect();
        return Err(SyncError::Permanent(format!("GraphQL: {}", messages.join("; "))));
    }
    response
        .data
        .ok_or_else(|| SyncError::Permanent("GraphQL response without data".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use rstest::rstest;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex as StdMutex};

    /// HTTP/1.1 stub, one request per connection. Logs `METHOD target body`.
    fn stub_server(
        route: impl Fn(&str, &str, &str) -> Value + Send + 'static,
    ) -> (String, Arc<StdMutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let log = Arc::new(StdMutex::new(Vec::new()));
        let seen = log.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let mut reader = BufReader::new(stream);
                let mut request_line = String::new();
                if reader.read_line(&mut request_line).is_err() {
                    continue;
                }
                let mut length = 0;
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                        break;
                    }
                    if let Some((key, value)) = line.split_once(':')
                        && key.eq_ignore_ascii_case("content-length")
                    {
                        length = value.trim().parse().unwrap_or(0);
                    }
                }
                let mut body = vec![0; length];
                reader.read_exact(&mut body).unwrap();
                let body = String::from_utf8_lossy(&body).into_owned();
                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or_default().to_string();
                let target = parts.next().unwrap_or_default().to_string();
                let reply = route(&method, &target, &body).to_string();
                seen.lock().unwrap().push(format!("{method} {target} {body}"));
                let mut stream = reader.into_inner();
                write!(
                    stream,
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
                    reply.len()
                )
                .unwrap();
            }
        });
        (base, log)
    }

    fn stub_gateway(config: &Config, base: &str) -> GitHubGateway {
        GitHubGateway::new(config, "token").unwrap().with_api_base(base)
    }

    #[rstest]
    #[case(429, "", true)]
    #[case(502, "bad gateway", true)]
    #[case(403, "API rate limit exceeded for user", true)]
    #[case(403, "Resource not accessible by integration", false)]
    #[case(404, "Not Found", false)]
    #[case(422, "Validation Failed", false)]
    fn http_statuses_are_classified(#[case] code: u16, #[case] body: &str, #[case] transient: bool) {
        let status = StatusCode::from_u16(code).unwrap();
        let err = status_error(status, &HeaderMap::new(), body);
        assert_eq!(err.is_transient(), transient, "{code} {body}");
    }

    #[test]
    fn exhausted_rate_limit_header_is_transient() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        assert!(status_error(StatusCode::FORBIDDEN, &headers, "{}").is_transient());
    }

    #[test]
    fn issue_json_maps_to_remote_issue() {
        let json = r#"{
            "number": 12,
            "node_id": "I_kwDO",
            "title": "Add dark mode",
            "state": "closed",
            "body": "<!-- tracker-id: T-001 -->",
            "labels": [{"name": "ui"}, {"name": "theme"}],
            "milestone": {"number": 3, "title": "v1.0"}
        }"#;
        let issue: IssueJson = serde_json::from_str(json).unwrap();
        assert!(issue.pull_request.is_none());
        let remote = issue.into_remote().unwrap();
        assert_eq!(remote.number, IssueNumber::new(12));
        assert_eq!(remote.status, Status::Closed);
        assert_eq!(remote.milestone.as_deref(), Some("v1.0"));
        assert_eq!(remote.labels.len(), 2);
        assert_eq!(remote.back_reference().unwrap().as_str(), "T-001");
    }

    #[test]
    fn patch_payload_only_carries_set_fields() {
        let patch = IssuePatch {
            title: Some("Add dark mode".into()),
            milestone: Some(None),
            ..IssuePatch::default()
        };
        let payload = patch_payload(&patch, Some(None));
        assert_eq!(payload, json!({ "title": "Add dark mode", "milestone": null }));
    }

    #[test]
    fn graphql_errors_are_permanent() {
        let response: GraphQlResponse<Value> = serde_json::from_str(
            r#"{"data": null, "errors": [{"message": "Could not resolve to a ProjectV2"}]}"#,
        )
        .unwrap();
        let err = graphql_data(response).unwrap_err();
        assert!(matches!(err, SyncError::Permanent(msg) if msg.contains("ProjectV2")));
    }

    #[test]
    fn project_page_parses_columns_and_items() {
        let json = r#"{
            "repositoryOwner": {
                "projectV2": {
                    "id": "PVT_1",
                    "field": {"id": "F_1", "options": [{"id": "o1", "name": "Todo"}]},
                    "items": {
                        "pageInfo": {"hasNextPage": false, "endCursor": null},
                        "nodes": [
                            {"id": "I_1", "content": {"number": 4, "repository": {"nameWithOwner": "octo/tracker"}},
                             "fieldValueByName": {"name": "Todo"}},
                            {"id": "I_2", "content": {}, "fieldValueByName": null}
                        ]
                    }
                }
            }
        }"#;
        let data: OwnerData = serde_json::from_str(json).unwrap();
        let project = data.repository_owner.unwrap().project.unwrap();
        assert_eq!(project.field.unwrap().options[0].name, "Todo");
        assert_eq!(project.items.nodes.len(), 2);
        assert_eq!(project.items.nodes[0].content.as_ref().unwrap().number, Some(4));
        assert!(project.items.nodes[1].content.as_ref().unwrap().number.is_none());
    }

    #[test]
    fn empty_token_is_a_configuration_error() {
        let config = Config::new("octo", "tracker", &["TODO"]);
        assert!(matches!(
            GitHubGateway::new(&config, " "),
            Err(SyncError::Configuration { .. })
        ));
    }

    #[test]
    fn owner_projects_match_titles_exactly() {
        let json = r#"{
            "repositoryOwner": {
                "id": "U_1",
                "projectsV2": {"nodes": [
                    {"number": 4, "title": "Roadmap 2024"},
                    {"number": 9, "title": "Roadmap"},
                    {"number": 11, "title": "Roadmap"}
                ]}
            }
        }"#;
        let data: OwnerProjectsData = serde_json::from_str(json).unwrap();
        let owner = data.repository_owner.unwrap();
        assert_eq!(owner.id, "U_1");
        assert_eq!(owner.numbered("Roadmap"), Some(9));
        assert_eq!(owner.numbered("Backlog"), None);

        let created: GraphQlResponse<CreateProjectData> = serde_json::from_str(
            r#"{"data": {"createProjectV2": {"projectV2": {"id": "PVT_9", "number": 12, "url": "https://github.com/users/octo/projects/12"}}}}"#,
        )
        .unwrap();
        assert_eq!(graphql_data(created).unwrap().create_project_v2.project.number, 12);
    }

    #[tokio::test]
    async fn milestones_on_later_pages_are_reused() {
        let (base, log) = stub_server(|method, target, _| match method {
            "GET" if target.ends_with("&page=1") => Value::Array(
                (1..=100)
                    .map(|n| json!({ "number": n, "title": format!("m{n}") }))
                    .collect(),
            ),
            "GET" if target.ends_with("&page=2") => json!([{ "number": 101, "title": "v2.0" }]),
            _ => json!({ "number": 999, "title": "v2.0" }),
        });
        let gateway = stub_gateway(&Config::new("octo", "tracker", &["TODO"]), &base);

        assert_eq!(gateway.milestone_number("v2.0").await.unwrap(), 101);
        assert_eq!(gateway.milestone_number("m7").await.unwrap(), 7);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2, "{log:?}");
        assert!(log.iter().all(|request| request.starts_with("GET /repos/octo/tracker/milestones?")));
    }

    #[tokio::test]
    async fn named_board_is_created_on_first_use_only() {
        let (base, log) = stub_server(|method, target, body| {
            if method == "GET" && target.starts_with("/repos/octo/tracker/issues/") {
                return json!({ "number": 5, "node_id": "I_5", "title": "t", "state": "open" });
            }
            if method == "GET" {
                return json!([]);
            }
            let data = if body.contains("createProjectV2") {
                json!({ "createProjectV2": { "projectV2": { "id": "PVT_9", "number": 9, "url": "u" } } })
            } else if body.contains("addProjectV2ItemById") {
                json!({ "addProjectV2ItemById": { "item": { "id": "PVTI_5" } } })
            } else if body.contains("projectsV2(") {
                json!({ "repositoryOwner": { "id": "U_1", "projectsV2": { "nodes": [
                    { "number": 4, "title": "Roadmap 2024" }
                ] } } })
            } else {
                json!({ "repositoryOwner": { "projectV2": {
                    "id": "PVT_9",
                    "field": { "id": "F_1", "options": [{ "id": "o1", "name": "Todo" }] },
                    "items": { "pageInfo": { "hasNextPage": false, "endCursor": null }, "nodes": [] }
                } } })
            };
            json!({ "data": data })
        });
        let mut config = Config::new("octo", "tracker", &["TODO"]);
        config.project_name = Some("Roadmap".into());
        let gateway = stub_gateway(&config, &base);

        let issues = gateway.list_issues().await.unwrap();
        assert!(issues.is_empty());
        let creations = |log: &[String]| log.iter().filter(|r| r.contains("createProjectV2")).count();
        assert_eq!(creations(&log.lock().unwrap()), 0);

        gateway.add_to_board(IssueNumber::new(5)).await.unwrap();
        gateway.move_column(IssueNumber::new(5), "Todo").await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(creations(&log), 1);
        assert!(
            log.iter()
                .any(|r| r.contains("projectV2(number") && r.contains(r#""number":9"#))
        );
        assert!(log.iter().any(|r| r.contains("addProjectV2ItemById")));
    }
}
