//! Work item model shared by all task sources.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing status of a work item within its source.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Waiting for an agent.
    #[default]
    Pending,
    /// Picked up by an agent that has not finished.
    Claimed,
    /// Finished; never dispatched again.
    Done,
}

impl WorkItemStatus {
    /// Whether the item still needs work.
    #[must_use]
    pub fn is_open(self) -> bool {
        !matches!(self, Self::Done)
    }

    /// Lowercase name, as serialized.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
        }
    }
}

/// One unit of inbound work discovered by a task source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    /// Identifier, unique within its source.
    pub id: String,
    /// Short summary.
    pub title: String,
    /// Full instructions handed to the agent.
    #[serde(default)]
    pub description: String,
    /// Processing status.
    #[serde(default)]
    pub status: WorkItemStatus,
    /// Free-form priority label, e.g. `High`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Labels attached at the source.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// When the item was first recorded.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Repository the agent should clone, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    /// Parent epic key shared by sibling items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Extra environment forwarded to the execution.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl WorkItem {
    /// Build a pending item with the given identity.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: WorkItemStatus::Pending,
            priority: None,
            labels: Vec::new(),
            created_at: Utc::now(),
            repo_url: None,
            parent: None,
            env: BTreeMap::new(),
        }
    }
}

/// Caller-supplied fields for [`crate::tasks::TaskSource::submit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewWorkItem {
    /// Short summary.
    pub title: String,
    /// Full instructions.
    pub description: String,
    /// Optional priority label.
    pub priority: Option<String>,
    /// Labels to attach.
    pub labels: Vec<String>,
    /// Repository the agent should clone.
    pub repo_url: Option<String>,
}
