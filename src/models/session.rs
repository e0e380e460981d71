//! Session model and lifecycle helpers.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Execution kind recorded for sessions launched by `start`.
pub const SESSION_TYPE_DETACHED: &str = "detached";

/// Execution kind recorded for sessions dispatched to a local container.
pub const SESSION_TYPE_ORCHESTRATED_DOCKER: &str = "orchestrated-docker";

/// Lifecycle status for a locally tracked session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Record exists but the process has not been launched.
    Created,
    /// Process launched and believed alive.
    Running,
    /// Legacy on-disk spelling of a suspended session; normalized on load
    /// to `Running` with [`Session::paused`] set.
    Paused,
    /// Process exited successfully.
    Completed,
    /// Process failed or vanished without reporting success.
    Error,
    /// Process was stopped by the operator.
    Stopped,
    /// Record moved to the archive namespace.
    Archived,
}

impl SessionStatus {
    /// Whether the status is one a finished session can rest in.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }

    /// Lowercase label used for display and in the JSON record.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
            Self::Archived => "archived",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked execution of an agent against a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Unique, human-chosen name; also the on-disk key.
    pub name: String,
    /// OS process ID (process group leader); 0 when no local process exists.
    #[serde(default)]
    pub pid: i32,
    /// Free-form execution kind, e.g. `detached`.
    #[serde(rename = "type", default)]
    pub session_type: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Set while the process group is suspended with SIGSTOP.
    #[serde(default)]
    pub paused: bool,
    /// Status held before archiving; restored by unarchive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_from: Option<SessionStatus>,
    /// Launch timestamp.
    pub start_time: DateTime<Utc>,
    /// Exit timestamp; `None` while running.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Command and arguments that were launched.
    #[serde(default)]
    pub command: Vec<String>,
    /// Directory the agent operates in.
    pub workspace: PathBuf,
    /// Append-only output log.
    pub log_file: PathBuf,
    /// Path to the agent's own usage/history JSON.
    #[serde(default)]
    pub agent_state_file: PathBuf,
    /// Workspace HEAD when the session started.
    #[serde(default)]
    pub start_commit_sha: String,
    /// Workspace HEAD when the session finished.
    #[serde(default)]
    pub end_commit_sha: String,
    /// Terminal failure text.
    #[serde(default)]
    pub error: String,
    /// First user-facing instruction.
    #[serde(default)]
    pub goal: String,
    /// Free-form labels.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Session {
    /// Construct a session in the `Created` state.
    #[must_use]
    pub fn new(name: &str, goal: &str, workspace: PathBuf, log_file: PathBuf) -> Self {
        let agent_state_file = workspace.join(".agent_state.json");
        Self {
            name: name.to_owned(),
            pid: 0,
            session_type: SESSION_TYPE_DETACHED.to_owned(),
            status: SessionStatus::Created,
            paused: false,
            archived_from: None,
            start_time: Utc::now(),
            end_time: None,
            command: Vec::new(),
            workspace,
            log_file,
            agent_state_file,
            start_commit_sha: String::new(),
            end_commit_sha: String::new(),
            error: String::new(),
            goal: goal.to_owned(),
            tags: BTreeSet::new(),
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// Pausing is a flag on a running session, not a transition.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        match (self.status, next) {
            (SessionStatus::Created, SessionStatus::Running)
            | (
                SessionStatus::Running,
                SessionStatus::Completed | SessionStatus::Error | SessionStatus::Stopped,
            ) => true,
            (from, SessionStatus::Archived) => from.is_terminal(),
            (SessionStatus::Archived, to) => self.archived_from == Some(to),
            _ => false,
        }
    }

    /// Status as shown to users: running sessions with the paused flag
    /// report `Paused`.
    #[must_use]
    pub fn display_status(&self) -> SessionStatus {
        if self.status == SessionStatus::Running && self.paused {
            SessionStatus::Paused
        } else {
            self.status
        }
    }

    /// Fold the legacy `paused` status into the running-plus-flag form.
    pub fn normalize(&mut self) {
        if self.status == SessionStatus::Paused {
            self.status = SessionStatus::Running;
            self.paused = true;
        }
    }

    /// Whether the record is bound to a local OS process that can be probed.
    #[must_use]
    pub fn has_local_process(&self) -> bool {
        self.pid > 0
    }
}
