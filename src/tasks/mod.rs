//! Task sources: where work items come from.
//!
//! [`TaskSource`] is the seam the orchestrator loop polls. The concrete
//! variant is picked once at startup and carried as [`AnyTaskSource`].

pub mod dir_drop;
pub mod file_queue;
pub mod github;
pub mod jira;

use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{GlobalConfig, TaskSourceKind};
use crate::models::work_item::{NewWorkItem, WorkItem};
use crate::Result;

pub use dir_drop::DirDropSource;
pub use file_queue::FileQueueSource;
pub use github::GitHubSource;
pub use jira::JiraSource;

/// Status reported when an execution fails.
pub const FAILED_STATUS: &str = "Failed";

/// Producer of open work items.
pub trait TaskSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Current open items. Side-effect free; called on every tick.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Tracker`/`Unavailable` for remote failures and
    /// `AppError::Store`/`Io` for local ones.
    fn list_open(&self) -> Pin<Box<dyn Future<Output = Result<Vec<WorkItem>>> + Send + '_>>;

    /// Append a new item and return it with its assigned ID. Never replaces
    /// an existing item.
    ///
    /// # Errors
    ///
    /// Same as [`TaskSource::list_open`].
    fn submit(
        &self,
        item: NewWorkItem,
    ) -> Pin<Box<dyn Future<Output = Result<WorkItem>> + Send + '_>>;

    /// Tell the source how an item's execution went: `status` names the
    /// target state (e.g. [`FAILED_STATUS`]) and `comment` is posted
    /// alongside it. Sources without a place to report to ignore it.
    ///
    /// # Errors
    ///
    /// Same as [`TaskSource::list_open`].
    fn update_status<'a>(
        &'a self,
        _item_id: &'a str,
        _status: &'a str,
        _comment: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

/// The configured task source.
pub enum AnyTaskSource {
    /// Jira search query.
    Tracker(JiraSource),
    /// GitHub issues of one repository.
    GitHub(GitHubSource),
    /// JSON array file.
    File(FileQueueSource),
    /// Directory of JSON files.
    Dir(DirDropSource),
}

impl AnyTaskSource {
    /// Build the source selected by `kind`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when a tracker source lacks settings or
    /// its HTTP client cannot be built.
    pub fn from_config(config: &GlobalConfig, kind: TaskSourceKind) -> Result<Self> {
        Ok(match kind {
            TaskSourceKind::Jira => {
                config.require_jira()?;
                Self::Tracker(JiraSource::new(&config.jira)?)
            }
            TaskSourceKind::GitHub => {
                config.require_github()?;
                Self::GitHub(GitHubSource::new(&config.github)?)
            }
            TaskSourceKind::File => Self::File(FileQueueSource::new(&config.orchestrator.work_file)),
            TaskSourceKind::Dir => Self::Dir(DirDropSource::new(&config.orchestrator.watch_dir)),
        })
    }

    fn inner(&self) -> &dyn TaskSource {
        match self {
            Self::Tracker(source) => source,
            Self::GitHub(source) => source,
            Self::File(source) => source,
            Self::Dir(source) => source,
        }
    }
}

impl TaskSource for AnyTaskSource {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn list_open(&self) -> Pin<Box<dyn Future<Output = Result<Vec<WorkItem>>> + Send + '_>> {
        self.inner().list_open()
    }

    fn submit(
        &self,
        item: NewWorkItem,
    ) -> Pin<Box<dyn Future<Output = Result<WorkItem>> + Send + '_>> {
        self.inner().submit(item)
    }

    fn update_status<'a>(
        &'a self,
        item_id: &'a str,
        status: &'a str,
        comment: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        self.inner().update_status(item_id, status, comment)
    }
}

/// Nanoseconds since the Unix epoch, used for time-ordered IDs.
pub(crate) fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos())
}
