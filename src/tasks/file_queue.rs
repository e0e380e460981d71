//! Work queue kept as a single JSON array file.
//!
//! Submits hold an exclusive advisory lock on a `<file>.lock` sidecar for the
//! whole read-modify-write, so writers in other processes cannot drop items.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use chrono::Utc;
use fs2::FileExt;
use tokio::sync::Mutex;
use tracing::{info, info_span, Instrument};

use crate::models::work_item::{NewWorkItem, WorkItem, WorkItemStatus};
use crate::persistence::write_atomic;
use crate::tasks::{unix_nanos, TaskSource};
use crate::{AppError, Result};

/// Task source reading and appending to one JSON array file.
pub struct FileQueueSource {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileQueueSource {
    /// Queue stored at `path`; the file is created on first submit.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Queue file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every item in the file regardless of status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the file is not a JSON array of items.
    pub async fn read_all(&self) -> Result<Vec<WorkItem>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AppError::Io(format!(
                    "cannot read {}: {err}",
                    self.path.display()
                )))
            }
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&raw).map_err(|err| {
            AppError::Store(format!("corrupt work queue {}: {err}", self.path.display()))
        })
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }

    async fn append(&self, new: NewWorkItem) -> Result<WorkItem> {
        let _held = self.write_lock.lock().await;
        let _file_lock = QueueLock::acquire(self.lock_path()).await?;
        let mut items = self.read_all().await?;

        let mut stamp = unix_nanos();
        let mut id = format!("TASK-{stamp}");
        while items.iter().any(|existing| existing.id == id) {
            stamp += 1;
            id = format!("TASK-{stamp}");
        }

        let item = WorkItem {
            description: new.description,
            priority: new.priority,
            labels: new.labels,
            repo_url: new.repo_url,
            created_at: Utc::now(),
            status: WorkItemStatus::Pending,
            ..WorkItem::new(id, new.title)
        };
        items.push(item.clone());

        let body = serde_json::to_vec_pretty(&items)?;
        write_atomic(&self.path, &body)?;

        info!(item_id = %item.id, "work item queued");
        Ok(item)
    }
}

impl TaskSource for FileQueueSource {
    fn name(&self) -> &'static str {
        "file"
    }

    fn list_open(&self) -> Pin<Box<dyn Future<Output = Result<Vec<WorkItem>>> + Send + '_>> {
        Box::pin(async move {
            let items = self.read_all().await?;
            Ok(items
                .into_iter()
                .filter(|item| item.status.is_open())
                .collect())
        })
    }

    fn submit(
        &self,
        item: NewWorkItem,
    ) -> Pin<Box<dyn Future<Output = Result<WorkItem>> + Send + '_>> {
        let span = info_span!("file_queue_submit", path = %self.path.display());
        Box::pin(self.append(item).instrument(span))
    }
}

/// Exclusive lock on the queue's sidecar file, released on drop.
struct QueueLock {
    file: File,
}

impl QueueLock {
    async fn acquire(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            file.lock_exclusive().map_err(|err| {
                AppError::Io(format!("cannot lock {}: {err}", path.display()))
            })?;
            Ok(Self { file })
        })
        .await
        .map_err(|err| AppError::Io(format!("queue lock task failed: {err}")))?
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(%err, "failed to release work queue lock");
        }
    }
}
