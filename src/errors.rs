//! Error types shared across the application.
//!
//! Variants fall into four groups: not-found, precondition, transient
//! infrastructure, and fatal. The grouping drives retry behaviour in the
//! orchestrator loop (see [`AppError::is_transient`]).

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// No session record exists under the given name.
    SessionNotFound(String),
    /// A live session already owns the requested name.
    DuplicateSession(String),
    /// The workspace has uncommitted changes and dirty starts are not allowed.
    WorkspaceDirty(String),
    /// The session is not running, so the signal cannot be delivered.
    NotRunning(String),
    /// The operation is refused because the session process is still alive.
    SessionRunning(String),
    /// No commit carries the requested iteration marker.
    CheckpointNotFound(String),
    /// The session is in a state that does not allow the requested transition.
    InvalidState(String),
    /// The session name is empty or would escape the sessions directory.
    InvalidName(String),
    /// Requested entity (work item, execution, file) does not exist.
    NotFound(String),
    /// Session store is unreadable or holds a corrupt record.
    Store(String),
    /// A git invocation failed.
    Git(String),
    /// OS process launch or signal delivery failure.
    Process(String),
    /// Issue tracker API failure.
    Tracker(String),
    /// Execution platform rejected or failed a spawn.
    Spawn(String),
    /// Execution platform or remote API is unreachable; retry later.
    Unavailable(String),
    /// Agent collaborator failure.
    Agent(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether the error names an absent session, checkpoint, or work item.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound(_) | Self::CheckpointNotFound(_) | Self::NotFound(_)
        )
    }

    /// Whether the error is a refused precondition the user must resolve.
    #[must_use]
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::DuplicateSession(_)
                | Self::WorkspaceDirty(_)
                | Self::NotRunning(_)
                | Self::SessionRunning(_)
                | Self::InvalidState(_)
                | Self::InvalidName(_)
        )
    }

    /// Whether retrying on the next poll interval may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Tracker(_) | Self::Spawn(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::SessionNotFound(name) => write!(f, "session not found: {name}"),
            Self::DuplicateSession(name) => {
                write!(f, "duplicate session: {name} is already running")
            }
            Self::WorkspaceDirty(msg) => write!(f, "workspace dirty: {msg}"),
            Self::NotRunning(msg) => write!(f, "not running: {msg}"),
            Self::SessionRunning(msg) => write!(f, "session running: {msg}"),
            Self::CheckpointNotFound(msg) => write!(f, "checkpoint not found: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::InvalidName(msg) => write!(f, "invalid session name: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Store(msg) => write!(f, "session store: {msg}"),
            Self::Git(msg) => write!(f, "git: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Tracker(msg) => write!(f, "tracker: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Unavailable(msg) => write!(f, "unavailable: {msg}"),
            Self::Agent(msg) => write!(f, "agent: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(format!("invalid json: {err}"))
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Tracker(err.to_string())
        }
    }
}
