//! GitHub Issues task source (REST API v3).
//!
//! Open issues carrying the agent label are work items with IDs `gh-<number>`.
//! Pull requests come back from the same endpoint and are skipped. An issue
//! that names no `Repo:` runs against the repository it was filed in.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, info_span, Instrument};

use crate::config::GitHubConfig;
use crate::models::work_item::{NewWorkItem, WorkItem, WorkItemStatus};
use crate::tasks::jira::extract_repo_url;
use crate::tasks::TaskSource;
use crate::{AppError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 10;
const USER_AGENT: &str = "recac-orchestrator";
const ID_PREFIX: &str = "gh-";

/// Task source backed by the issues of one repository.
pub struct GitHubSource {
    client: reqwest::Client,
    api_url: String,
    token: String,
    owner: String,
    repo: String,
    label: String,
}

impl GitHubSource {
    /// Build a source from connection settings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(config: &GitHubConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| AppError::Config(format!("cannot build http client: {err}")))?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_owned(),
            token: config.token.clone(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            label: config.label.clone(),
        })
    }

    fn repo_path(&self) -> String {
        format!("/repos/{}/{}", self.owner, self.repo)
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<reqwest::Response> {
        let url = format!("{}{path}", self.api_url);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("Accept", "application/vnd.github+json");
        if !self.token.is_empty() {
            request = request.header("Authorization", format!("token {}", self.token));
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = request.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let msg = format!("{method} {path} returned {}: {}", status.as_u16(), text.trim());
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                AppError::Unavailable(msg)
            } else {
                AppError::Tracker(msg)
            });
        }
        Ok(resp)
    }

    async fn open_issues(&self) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();

        for page in 1..=MAX_PAGES {
            let path = format!(
                "{}/issues?state=open&labels={}&per_page={PAGE_SIZE}&page={page}",
                self.repo_path(),
                self.label
            );
            let issues: Vec<GitHubIssue> = self
                .send(Method::GET, &path, None)
                .await?
                .json()
                .await
                .map_err(|err| AppError::Tracker(format!("unexpected issues response: {err}")))?;
            let full_page = issues.len() == PAGE_SIZE;

            for issue in issues {
                if issue.pull_request.is_some() {
                    debug!(number = issue.number, "pull request; skipping");
                    continue;
                }
                items.push(self.work_item(issue));
            }
            if !full_page {
                break;
            }
        }

        debug!(count = items.len(), "github issue listing complete");
        Ok(items)
    }

    fn work_item(&self, issue: GitHubIssue) -> WorkItem {
        let description = issue.body.unwrap_or_default();
        let repo_url = extract_repo_url(&description)
            .unwrap_or_else(|| format!("https://github.com/{}/{}", self.owner, self.repo));
        let mut env = BTreeMap::new();
        env.insert("GITHUB_ISSUE".to_owned(), issue.number.to_string());

        WorkItem {
            description,
            status: WorkItemStatus::Pending,
            labels: issue.labels.into_iter().map(|label| label.name).collect(),
            created_at: issue.created_at.unwrap_or_else(Utc::now),
            repo_url: Some(repo_url),
            env,
            ..WorkItem::new(format!("{ID_PREFIX}{}", issue.number), issue.title)
        }
    }

    async fn create(&self, new: NewWorkItem) -> Result<WorkItem> {
        let mut body = new.description.clone();
        if let Some(repo) = &new.repo_url {
            body = format!("{body}\n\nRepo: {repo}");
        }
        let mut labels = vec![self.label.clone()];
        for label in &new.labels {
            if !labels.contains(label) {
                labels.push(label.clone());
            }
        }

        let payload = json!({ "title": new.title, "body": body.trim(), "labels": labels });
        let created: GitHubIssue = self
            .send(Method::POST, &format!("{}/issues", self.repo_path()), Some(&payload))
            .await?
            .json()
            .await
            .map_err(|err| AppError::Tracker(format!("unexpected create response: {err}")))?;

        info!(number = created.number, "github issue created");
        Ok(WorkItem {
            description: new.description,
            priority: new.priority,
            labels,
            repo_url: new.repo_url,
            ..WorkItem::new(format!("{ID_PREFIX}{}", created.number), new.title)
        })
    }

    async fn report(&self, item_id: &str, status: &str, comment: &str) -> Result<()> {
        let number = item_id.strip_prefix(ID_PREFIX).unwrap_or(item_id);
        let issue_path = format!("{}/issues/{number}", self.repo_path());

        if !comment.is_empty() {
            let body = json!({ "body": comment });
            self.send(Method::POST, &format!("{issue_path}/comments"), Some(&body))
                .await?;
            debug!(number, "comment added");
        }
        if status.eq_ignore_ascii_case("done") || status.eq_ignore_ascii_case("closed") {
            let body = json!({ "state": "closed" });
            self.send(Method::PATCH, &issue_path, Some(&body)).await?;
            info!(number, "issue closed");
        }
        Ok(())
    }
}

impl TaskSource for GitHubSource {
    fn name(&self) -> &'static str {
        "github"
    }

    fn list_open(&self) -> Pin<Box<dyn Future<Output = Result<Vec<WorkItem>>> + Send + '_>> {
        let span = info_span!("github_list_open", repo = %self.repo);
        Box::pin(self.open_issues().instrument(span))
    }

    fn submit(
        &self,
        item: NewWorkItem,
    ) -> Pin<Box<dyn Future<Output = Result<WorkItem>> + Send + '_>> {
        let span = info_span!("github_submit", repo = %self.repo);
        Box::pin(self.create(item).instrument(span))
    }

    fn update_status<'a>(
        &'a self,
        item_id: &'a str,
        status: &'a str,
        comment: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        let span = info_span!("github_update_status", item_id, status);
        Box::pin(self.report(item_id, status, comment).instrument(span))
    }
}

// ── Wire types ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GitHubIssue {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<IssueLabel>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pull_request: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct IssueLabel {
    name: String,
}
