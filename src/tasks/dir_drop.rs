//! Work queue kept as one JSON file per item in a watched directory.
//!
//! Submissions create `task-<nanos>.json` with an exclusive create, so two
//! writers never overwrite each other. [`DirDropSource::watch`] turns new
//! files into wake-ups for the orchestrator loop.

use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::models::work_item::{NewWorkItem, WorkItem, WorkItemStatus};
use crate::tasks::{unix_nanos, TaskSource};
use crate::{AppError, Result};

const MAX_CREATE_ATTEMPTS: u32 = 16;

/// Task source over a drop directory.
#[derive(Debug, Clone)]
pub struct DirDropSource {
    dir: PathBuf,
}

/// Live directory watcher; dropping it stops the watch.
pub struct DirWatch {
    _watcher: RecommendedWatcher,
    wake: Arc<Notify>,
}

impl DirWatch {
    /// Notifier signalled whenever a task file appears or changes.
    #[must_use]
    pub fn wake(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }
}

impl DirDropSource {
    /// Source reading `dir`; the directory is created on first use.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Drop directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start watching the directory for new task files.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory or the watcher cannot be set up.
    pub fn watch(&self) -> Result<DirWatch> {
        std::fs::create_dir_all(&self.dir)?;
        let wake = Arc::new(Notify::new());
        let signal = Arc::clone(&wake);

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) if is_task_event(&event) => {
                    debug!(paths = ?event.paths, "task file changed");
                    signal.notify_one();
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "task directory watcher error"),
            },
        )
        .map_err(|err| AppError::Io(format!("failed to create watcher: {err}")))?;

        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .map_err(|err| AppError::Io(format!("failed to watch directory: {err}")))?;

        info!(dir = %self.dir.display(), "watching task directory");
        Ok(DirWatch {
            _watcher: watcher,
            wake,
        })
    }

    fn read_items(&self) -> Result<Vec<WorkItem>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AppError::Io(format!(
                    "cannot read {}: {err}",
                    self.dir.display()
                )))
            }
        };

        let mut items = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_task_file(&path) {
                continue;
            }
            let parsed = std::fs::read(&path)
                .map_err(|err| err.to_string())
                .and_then(|raw| {
                    serde_json::from_slice::<WorkItem>(&raw).map_err(|err| err.to_string())
                });
            match parsed {
                Ok(item) => items.push(item),
                Err(err) => warn!(path = %path.display(), %err, "skipping invalid task file"),
            }
        }
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    fn create_item(&self, new: NewWorkItem) -> Result<WorkItem> {
        std::fs::create_dir_all(&self.dir)?;
        let mut stamp = unix_nanos();

        for _ in 0..MAX_CREATE_ATTEMPTS {
            let path = self.dir.join(format!("task-{stamp}.json"));
            let item = WorkItem {
                description: new.description.clone(),
                priority: new.priority.clone(),
                labels: new.labels.clone(),
                repo_url: new.repo_url.clone(),
                status: WorkItemStatus::Pending,
                ..WorkItem::new(format!("TASK-{stamp}"), new.title.clone())
            };
            let body = serde_json::to_vec_pretty(&item)?;

            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    file.write_all(&body).map_err(|err| {
                        AppError::Io(format!("cannot write {}: {err}", path.display()))
                    })?;
                    info!(item_id = %item.id, path = %path.display(), "work item dropped");
                    return Ok(item);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => stamp += 1,
                Err(err) => {
                    return Err(AppError::Io(format!(
                        "cannot create {}: {err}",
                        path.display()
                    )))
                }
            }
        }

        Err(AppError::Io(format!(
            "could not find a free task file name in {}",
            self.dir.display()
        )))
    }
}

impl TaskSource for DirDropSource {
    fn name(&self) -> &'static str {
        "dir"
    }

    fn list_open(&self) -> Pin<Box<dyn Future<Output = Result<Vec<WorkItem>>> + Send + '_>> {
        Box::pin(async move {
            Ok(self
                .read_items()?
                .into_iter()
                .filter(|item| item.status.is_open())
                .collect())
        })
    }

    fn submit(
        &self,
        item: NewWorkItem,
    ) -> Pin<Box<dyn Future<Output = Result<WorkItem>> + Send + '_>> {
        Box::pin(async move { self.create_item(item) })
    }
}

fn is_task_file(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == "json")
}

fn is_task_event(event: &Event) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|path| path.extension().is_some_and(|ext| ext == "json"))
}
