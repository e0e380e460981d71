//! Jira-backed task source (REST API v3).
//!
//! Open items come from a JQL search; blocked issues are held back until
//! their blockers are done, and issues that name no `Repo:` are skipped.
//! Submitting files a new issue carrying the agent label so the next search
//! picks it up. Failures are reported back as a comment plus a workflow
//! transition.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::JiraConfig;
use crate::models::work_item::{NewWorkItem, WorkItem, WorkItemStatus};
use crate::orchestrator::spawner::sanitize_label;
use crate::tasks::TaskSource;
use crate::{AppError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: u32 = 50;
const MAX_PAGES: usize = 20;
const SEARCH_FIELDS: &[&str] = &[
    "summary",
    "description",
    "status",
    "priority",
    "labels",
    "created",
    "parent",
    "issuelinks",
];

const MAX_FEATURE_SLUG: usize = 30;

static REPO_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)Repo: (https?://\S+)").ok());

static FEATURES_HEADER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^(REQUIRED FEATURES|ACCEPTANCE CRITERIA):?\s*$").ok()
});

/// Task source backed by a Jira search.
pub struct JiraSource {
    client: reqwest::Client,
    base_url: String,
    username: String,
    api_token: String,
    jql: String,
    label: String,
    project_key: String,
    issue_type: String,
}

impl JiraSource {
    /// Build a source from connection settings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(config: &JiraConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| AppError::Config(format!("cannot build http client: {err}")))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
            username: config.username.clone(),
            api_token: config.api_token.clone(),
            jql: config.effective_jql(),
            label: config.label.clone(),
            project_key: config.project_key.clone(),
            issue_type: config.issue_type.clone(),
        })
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<reqwest::Response> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .basic_auth(&self.username, Some(&self.api_token))
            .header("Accept", "application/json");
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

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        Ok(self.send(Method::POST, path, Some(body)).await?.json().await?)
    }

    async fn search(&self) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();
        let mut next_page: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut body = json!({
                "jql": self.jql,
                "maxResults": PAGE_SIZE,
                "fields": SEARCH_FIELDS,
            });
            if let Some(token) = &next_page {
                body["nextPageToken"] = json!(token);
            }

            let page: SearchPage = serde_json::from_value(self.post("/rest/api/3/search/jql", &body).await?)
                .map_err(|err| AppError::Tracker(format!("unexpected search response: {err}")))?;

            for issue in page.issues {
                if let Some(blocker) = issue.open_blocker() {
                    debug!(key = %issue.key, blocker, "issue is blocked; skipping");
                    continue;
                }
                let key = issue.key.clone();
                match issue.into_work_item() {
                    Some(item) => items.push(item),
                    None => warn!(%key, "issue names no Repo: URL; skipping"),
                }
            }

            match page.next_page_token {
                Some(token) if !page.is_last.unwrap_or(false) => next_page = Some(token),
                _ => break,
            }
        }

        debug!(count = items.len(), "jira search complete");
        Ok(items)
    }

    async fn create(&self, new: NewWorkItem) -> Result<WorkItem> {
        let mut text = new.description.clone();
        if let Some(repo) = &new.repo_url {
            text = format!("{text}\n\nRepo: {repo}");
        }

        let mut labels = vec![self.label.clone()];
        for label in &new.labels {
            if !labels.contains(label) {
                labels.push(label.clone());
            }
        }

        let mut fields = json!({
            "project": { "key": self.project_key },
            "summary": new.title,
            "description": text_to_adf(text.trim()),
            "issuetype": { "name": self.issue_type },
            "labels": labels,
        });
        if let Some(priority) = &new.priority {
            fields["priority"] = json!({ "name": priority });
        }

        let created: CreatedIssue = serde_json::from_value(
            self.post("/rest/api/3/issue", &json!({ "fields": fields }))
                .await?,
        )
        .map_err(|err| AppError::Tracker(format!("unexpected create response: {err}")))?;

        info!(key = %created.key, "jira issue created");
        Ok(WorkItem {
            description: new.description,
            priority: new.priority,
            labels,
            repo_url: new.repo_url,
            ..WorkItem::new(created.key, new.title)
        })
    }

    async fn report(&self, key: &str, status: &str, comment: &str) -> Result<()> {
        if !comment.is_empty() {
            let body = json!({ "body": text_to_adf(comment) });
            self.send(Method::POST, &format!("/rest/api/3/issue/{key}/comment"), Some(&body))
                .await?;
            debug!(key, "comment added");
        }
        if status.is_empty() {
            return Ok(());
        }

        let path = format!("/rest/api/3/issue/{key}/transitions");
        let available: Transitions = self
            .send(Method::GET, &path, None)
            .await?
            .json()
            .await
            .map_err(|err| AppError::Tracker(format!("unexpected transitions response: {err}")))?;
        let Some(transition) = available
            .transitions
            .iter()
            .find(|t| t.id == status || t.name.eq_ignore_ascii_case(status))
        else {
            return Err(AppError::Tracker(format!(
                "no transition matching '{status}' for {key}"
            )));
        };
        let body = json!({ "transition": { "id": transition.id } });
        self.send(Method::POST, &path, Some(&body)).await?;
        info!(key, transition = %transition.name, "issue transitioned");
        Ok(())
    }
}

impl TaskSource for JiraSource {
    fn name(&self) -> &'static str {
        "jira"
    }

    fn list_open(&self) -> Pin<Box<dyn Future<Output = Result<Vec<WorkItem>>> + Send + '_>> {
        let span = info_span!("jira_list_open");
        Box::pin(self.search().instrument(span))
    }

    fn submit(
        &self,
        item: NewWorkItem,
    ) -> Pin<Box<dyn Future<Output = Result<WorkItem>> + Send + '_>> {
        let span = info_span!("jira_submit", project = %self.project_key);
        Box::pin(self.create(item).instrument(span))
    }

    fn update_status<'a>(
        &'a self,
        item_id: &'a str,
        status: &'a str,
        comment: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        let span = info_span!("jira_update_status", key = item_id, status);
        Box::pin(self.report(item_id, status, comment).instrument(span))
    }
}

// ── Wire types ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPage {
    #[serde(default)]
    issues: Vec<Issue>,
    next_page_token: Option<String>,
    is_last: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct CreatedIssue {
    key: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Transitions {
    transitions: Vec<Transition>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Transition {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct Issue {
    key: String,
    #[serde(default)]
    fields: IssueFields,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IssueFields {
    summary: String,
    description: Value,
    status: Option<IssueStatus>,
    priority: Option<Named>,
    labels: Vec<String>,
    created: Option<String>,
    parent: Option<ParentRef>,
    issuelinks: Vec<IssueLink>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueStatus {
    status_category: Option<StatusCategory>,
}

#[derive(Debug, Deserialize)]
struct StatusCategory {
    key: String,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ParentRef {
    key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueLink {
    #[serde(rename = "type")]
    link_type: Option<LinkType>,
    inward_issue: Option<LinkedIssue>,
}

#[derive(Debug, Deserialize)]
struct LinkType {
    inward: String,
}

#[derive(Debug, Deserialize)]
struct LinkedIssue {
    key: String,
    fields: Option<LinkedFields>,
}

#[derive(Debug, Deserialize)]
struct LinkedFields {
    status: Option<IssueStatus>,
}

fn category_key(status: Option<&IssueStatus>) -> Option<&str> {
    status
        .and_then(|s| s.status_category.as_ref())
        .map(|c| c.key.as_str())
}

impl Issue {
    fn open_blocker(&self) -> Option<&str> {
        self.fields.issuelinks.iter().find_map(|link| {
            let kind = link.link_type.as_ref()?;
            if !kind.inward.eq_ignore_ascii_case("is blocked by") {
                return None;
            }
            let blocker = link.inward_issue.as_ref()?;
            let done = category_key(blocker.fields.as_ref().and_then(|f| f.status.as_ref()))
                == Some("done");
            (!done).then_some(blocker.key.as_str())
        })
    }

    fn into_work_item(self) -> Option<WorkItem> {
        let description = adf_to_text(&self.fields.description);
        let repo_url = extract_repo_url(&description)?;
        let status = match category_key(self.fields.status.as_ref()) {
            Some("done") => WorkItemStatus::Done,
            Some("indeterminate") => WorkItemStatus::Claimed,
            _ => WorkItemStatus::Pending,
        };
        let created_at = self
            .fields
            .created
            .as_deref()
            .and_then(parse_jira_time)
            .unwrap_or_else(Utc::now);

        let mut env = BTreeMap::new();
        env.insert("JIRA_TICKET".to_owned(), self.key.clone());
        let features = required_features(&description);
        if !features.is_empty() {
            let list = FeatureList {
                project_name: &self.fields.summary,
                features: &features,
            };
            match serde_json::to_string(&list) {
                Ok(json) => {
                    env.insert("RECAC_INJECTED_FEATURES".to_owned(), json);
                }
                Err(err) => warn!(key = %self.key, %err, "cannot encode required features"),
            }
        }

        Some(WorkItem {
            repo_url: Some(repo_url),
            description,
            status,
            priority: self.fields.priority.map(|p| p.name),
            labels: self.fields.labels,
            created_at,
            parent: self.fields.parent.map(|p| p.key),
            env,
            ..WorkItem::new(self.key, self.fields.summary)
        })
    }
}

fn parse_jira_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

/// Flatten an Atlassian document (or a plain string) into text, one line
/// per block node.
#[must_use]
pub fn adf_to_text(doc: &Value) -> String {
    fn walk(node: &Value, out: &mut String) {
        match node {
            Value::String(text) => out.push_str(text),
            Value::Object(map) => {
                if let Some(Value::String(text)) = map.get("text") {
                    out.push_str(text);
                }
                if map.get("type").and_then(Value::as_str) == Some("hardBreak") {
                    out.push('\n');
                }
                if let Some(Value::Array(children)) = map.get("content") {
                    for child in children {
                        walk(child, out);
                    }
                }
                let block = matches!(
                    map.get("type").and_then(Value::as_str),
                    Some("paragraph" | "heading" | "listItem" | "codeBlock" | "blockquote")
                );
                if block && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Value::Array(items) => {
                for item in items {
                    walk(item, out);
                }
            }
            _ => {}
        }
    }

    let mut out = String::new();
    walk(doc, &mut out);
    out.trim().to_owned()
}

/// Wrap plain text in a minimal Atlassian document, one paragraph per line.
#[must_use]
pub fn text_to_adf(text: &str) -> Value {
    let paragraphs: Vec<Value> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            json!({
                "type": "paragraph",
                "content": [{ "type": "text", "text": line }],
            })
        })
        .collect();
    json!({ "type": "doc", "version": 1, "content": paragraphs })
}

/// First `Repo: <url>` reference in a description, without trailing
/// punctuation or `.git`.
#[must_use]
pub fn extract_repo_url(description: &str) -> Option<String> {
    let pattern = REPO_PATTERN.as_ref()?;
    pattern
        .captures(description)
        .and_then(|caps| caps.get(1))
        .map(|url| {
            let url = url.as_str().trim_end_matches(['.', ',', ')']);
            url.strip_suffix(".git").unwrap_or(url).to_owned()
        })
}

/// One entry of a `REQUIRED FEATURES:` or `ACCEPTANCE CRITERIA:` list,
/// shaped the way agents read `RECAC_INJECTED_FEATURES`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequiredFeature {
    /// `req-<slug of the description>`.
    pub id: String,
    /// The bullet text.
    pub description: String,
    /// Always `functional`.
    pub category: String,
    /// Always `critical`.
    pub priority: String,
    /// Always `pending`.
    pub status: String,
}

#[derive(Serialize)]
struct FeatureList<'a> {
    project_name: &'a str,
    features: &'a [RequiredFeature],
}

/// Bullets (`- ` or `* `) listed under a `REQUIRED FEATURES:` or
/// `ACCEPTANCE CRITERIA:` header. A list ends at the next `Something:`
/// header line.
#[must_use]
pub fn required_features(description: &str) -> Vec<RequiredFeature> {
    let Some(header) = FEATURES_HEADER.as_ref() else {
        return Vec::new();
    };
    let mut features = Vec::new();
    let mut in_section = false;

    for line in description.lines().map(str::trim) {
        if header.is_match(line) {
            in_section = true;
            continue;
        }
        if !in_section {
            continue;
        }
        let bullet = line.strip_prefix("- ").or_else(|| line.strip_prefix("* "));
        match bullet {
            Some(text) => {
                let text = text.trim();
                let mut slug = sanitize_label(text);
                slug.truncate(MAX_FEATURE_SLUG);
                features.push(RequiredFeature {
                    id: format!("req-{}", slug.trim_end_matches('-')),
                    description: text.to_owned(),
                    category: "functional".into(),
                    priority: "critical".into(),
                    status: "pending".into(),
                });
            }
            None if line.ends_with(':') => break,
            None => {}
        }
    }
    features
}
