//! Execution spawners: where a dispatched work item runs.
//!
//! [`Spawner`] launches one disposable environment per item and answers
//! whether it is still running. The orchestrator guarantees it never asks
//! for a second execution of an item while the first is outstanding; the
//! spawner itself does not retry.

pub mod docker;
pub mod kubernetes;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use chrono::{DateTime, Utc};

use crate::config::{AgentConfig, GlobalConfig, SpawnerMode};
use crate::models::work_item::WorkItem;
use crate::orchestrator::session_manager::SessionManager;
use crate::Result;

pub use docker::DockerSpawner;
pub use kubernetes::KubernetesSpawner;

/// Boxed future returned by [`Spawner`] methods.
pub type SpawnFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Label carrying the sanitized work item ID on containers and jobs.
pub const WORK_ITEM_LABEL: &str = "recac.io/work-item";

/// Host variables forwarded into local containers when set.
pub const SECRET_PASSTHROUGH: &[&str] = &[
    "JIRA_API_TOKEN",
    "JIRA_USERNAME",
    "JIRA_URL",
    "GITHUB_TOKEN",
    "GITHUB_API_KEY",
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GEMINI_API_KEY",
    "OPENROUTER_API_KEY",
];

const AGENT_GIT_NAME: &str = "RECAC Agent";
const AGENT_GIT_EMAIL: &str = "agent@recac.io";
const MAX_LABEL_LEN: usize = 63;

/// Lines of output kept when an execution fails.
pub const FAILURE_OUTPUT_LINES: usize = 50;

/// Reference to one launched execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionHandle {
    /// Work item the execution serves.
    pub item_id: String,
    /// Platform identifier: container ID or job name.
    pub id: String,
    /// When the execution was launched (or adopted).
    pub started_at: DateTime<Utc>,
    /// Host workspace, for local containers.
    pub workspace: Option<PathBuf>,
}

/// How a finished execution ended, as reported by [`Spawner::finalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The agent exited cleanly.
    Succeeded,
    /// The agent failed.
    Failed {
        /// Short cause, e.g. the exit status.
        reason: String,
        /// Tail of the execution's output.
        output: String,
    },
    /// The platform no longer knows how the execution ended.
    Unknown,
}

/// Launches and tracks isolated executions.
pub trait Spawner: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Launch an execution for `item`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` when the platform rejects the execution and
    /// `AppError::Unavailable` when it cannot be reached.
    fn spawn<'a>(&'a self, item: &'a WorkItem, agent: &'a AgentConfig)
        -> SpawnFuture<'a, ExecutionHandle>;

    /// Whether the execution is still running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` when the platform cannot be reached.
    fn is_active<'a>(&'a self, handle: &'a ExecutionHandle) -> SpawnFuture<'a, bool>;

    /// A running execution labelled with `item_id`, if the platform has one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` when the platform cannot be reached.
    fn find_active<'a>(&'a self, item_id: &'a str) -> SpawnFuture<'a, Option<ExecutionHandle>>;

    /// Release platform resources after the execution finished and report
    /// how it ended.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` or `AppError::Unavailable`.
    fn finalize<'a>(&'a self, handle: &'a ExecutionHandle)
        -> SpawnFuture<'a, ExecutionOutcome>;

    /// Output collected from the execution.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the execution is gone.
    fn logs<'a>(&'a self, handle: &'a ExecutionHandle) -> SpawnFuture<'a, String>;

    /// Finished executions this spawner launched that still hold platform
    /// resources, such as ones that exited while no orchestrator was
    /// running. Platforms that clean up after themselves report none.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unavailable` when the platform cannot be reached.
    fn finished(&self) -> SpawnFuture<'_, Vec<ExecutionHandle>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// The configured spawner.
pub enum AnySpawner {
    /// Local containers.
    Local(DockerSpawner),
    /// Cluster jobs.
    Cluster(KubernetesSpawner),
}

impl AnySpawner {
    /// Build the spawner selected by `mode`. Local containers are recorded
    /// as sessions through `sessions` when given.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when cluster settings cannot be resolved.
    pub fn from_config(
        config: &GlobalConfig,
        mode: SpawnerMode,
        sessions: Option<std::sync::Arc<dyn SessionManager>>,
    ) -> Result<Self> {
        Ok(match mode {
            SpawnerMode::Docker => {
                let spawner = DockerSpawner::new(config.docker.clone());
                Self::Local(match sessions {
                    Some(sessions) => spawner.with_sessions(sessions),
                    None => spawner,
                })
            }
            SpawnerMode::Kubernetes => {
                Self::Cluster(KubernetesSpawner::from_config(&config.kubernetes)?)
            }
        })
    }

    fn inner(&self) -> &dyn Spawner {
        match self {
            Self::Local(spawner) => spawner,
            Self::Cluster(spawner) => spawner,
        }
    }
}

impl Spawner for AnySpawner {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn spawn<'a>(
        &'a self,
        item: &'a WorkItem,
        agent: &'a AgentConfig,
    ) -> SpawnFuture<'a, ExecutionHandle> {
        self.inner().spawn(item, agent)
    }

    fn is_active<'a>(&'a self, handle: &'a ExecutionHandle) -> SpawnFuture<'a, bool> {
        self.inner().is_active(handle)
    }

    fn find_active<'a>(&'a self, item_id: &'a str) -> SpawnFuture<'a, Option<ExecutionHandle>> {
        self.inner().find_active(item_id)
    }

    fn finalize<'a>(&'a self, handle: &'a ExecutionHandle) -> SpawnFuture<'a, ExecutionOutcome> {
        self.inner().finalize(handle)
    }

    fn logs<'a>(&'a self, handle: &'a ExecutionHandle) -> SpawnFuture<'a, String> {
        self.inner().logs(handle)
    }

    fn finished(&self) -> SpawnFuture<'_, Vec<ExecutionHandle>> {
        self.inner().finished()
    }
}

/// Environment every execution receives: agent selection, task details,
/// git identity, and the item's own variables.
#[must_use]
pub fn execution_env(item: &WorkItem, agent: &AgentConfig) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("RECAC_PROVIDER".to_owned(), agent.provider.clone());
    if !agent.model.is_empty() {
        env.insert("RECAC_MODEL".to_owned(), agent.model.clone());
    }
    env.insert("RECAC_PROJECT_ID".to_owned(), item.id.clone());
    env.insert("RECAC_TASK_TITLE".to_owned(), item.title.clone());
    env.insert("RECAC_TASK_DESCRIPTION".to_owned(), item.description.clone());
    if let Some(repo) = &item.repo_url {
        env.insert("RECAC_REPO_URL".to_owned(), repo.clone());
    }
    env.insert("GIT_TERMINAL_PROMPT".to_owned(), "0".to_owned());
    for key in ["GIT_AUTHOR_NAME", "GIT_COMMITTER_NAME"] {
        env.insert(key.to_owned(), AGENT_GIT_NAME.to_owned());
    }
    for key in ["GIT_AUTHOR_EMAIL", "GIT_COMMITTER_EMAIL"] {
        env.insert(key.to_owned(), AGENT_GIT_EMAIL.to_owned());
    }
    for (key, value) in &item.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// Reduce an ID to a DNS-label-safe value: lowercase, runs of other
/// characters collapsed to `-`, trimmed, at most 63 characters.
#[must_use]
pub fn sanitize_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for c in raw.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out.truncate(MAX_LABEL_LEN);
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "item".to_owned()
    } else {
        trimmed.to_owned()
    }
}
