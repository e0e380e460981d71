//! The orchestrator loop: poll the task source, dispatch new work, sweep
//! finished executions.
//!
//! A failed execution is reported back to the task source with the tail of
//! its output.
//!
//! The spawn record map is the single source of dedup truth inside one
//! process. After a restart it is empty, so every candidate is first
//! cross-checked against the platform with [`Spawner::find_active`] and
//! adopted instead of spawned when an execution already exists.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{AgentConfig, GlobalConfig};
use crate::models::work_item::WorkItem;
use crate::orchestrator::spawner::{ExecutionHandle, ExecutionOutcome, Spawner};
use crate::tasks::{TaskSource, FAILED_STATUS};
use crate::Result;

/// Outstanding execution for one work item.
#[derive(Debug, Clone)]
pub struct SpawnRecord {
    /// Platform handle.
    pub handle: ExecutionHandle,
    /// When this process spawned or adopted it.
    pub started_at: DateTime<Utc>,
}

/// Counts from one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Open items returned by the source.
    pub listed: usize,
    /// New executions launched.
    pub spawned: usize,
    /// Executions found already running and taken over.
    pub adopted: usize,
    /// Items whose spawn or cross-check failed.
    pub failed: usize,
}

enum Outcome {
    Spawned,
    Adopted,
    Failed,
}

/// Polling control loop tying a task source to a spawner.
pub struct Orchestrator<T, S> {
    source: T,
    spawner: S,
    agent: AgentConfig,
    interval: Duration,
    sweep_every: u64,
    max_parallel_spawns: usize,
    max_active: usize,
    records: Mutex<HashMap<String, SpawnRecord>>,
    wake: Option<Arc<Notify>>,
}

impl<T: TaskSource, S: Spawner> Orchestrator<T, S> {
    /// Loop with a one-minute interval, four parallel spawns, and no cap
    /// on outstanding executions.
    #[must_use]
    pub fn new(source: T, spawner: S, agent: AgentConfig) -> Self {
        Self {
            source,
            spawner,
            agent,
            interval: Duration::from_secs(60),
            sweep_every: 1,
            max_parallel_spawns: 4,
            max_active: 0,
            records: Mutex::new(HashMap::new()),
            wake: None,
        }
    }

    /// Loop tuned from the `[orchestrator]` and `[agent]` sections.
    #[must_use]
    pub fn from_config(source: T, spawner: S, config: &GlobalConfig) -> Self {
        let tuning = &config.orchestrator;
        Self::new(source, spawner, config.agent.clone())
            .interval(Duration::from_secs(tuning.interval_seconds))
            .sweep_every(tuning.sweep_every_ticks)
            .max_parallel_spawns(tuning.max_parallel_spawns)
            .max_active(tuning.max_active)
    }

    /// Time between ticks.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sweep every `ticks` ticks; zero is treated as one.
    #[must_use]
    pub fn sweep_every(mut self, ticks: u32) -> Self {
        self.sweep_every = u64::from(ticks.max(1));
        self
    }

    /// Cap on simultaneous spawn calls within a tick; zero is treated as one.
    #[must_use]
    pub fn max_parallel_spawns(mut self, limit: usize) -> Self {
        self.max_parallel_spawns = limit.max(1);
        self
    }

    /// Cap on outstanding executions; zero means unbounded.
    #[must_use]
    pub fn max_active(mut self, limit: usize) -> Self {
        self.max_active = limit;
        self
    }

    /// Cut the inter-tick sleep short whenever `wake` is notified.
    #[must_use]
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// The task source.
    pub fn source(&self) -> &T {
        &self.source
    }

    /// The spawner.
    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    /// Number of outstanding executions.
    pub async fn active_count(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Spawn record for `item_id`, if one is outstanding.
    pub async fn record(&self, item_id: &str) -> Option<SpawnRecord> {
        self.records.lock().await.get(item_id).cloned()
    }

    /// One poll-and-dispatch pass.
    ///
    /// Transient source failures are logged and yield an empty report;
    /// per-item failures are counted and never abort the pass.
    ///
    /// # Errors
    ///
    /// Returns the source error when it is not transient (a corrupt local
    /// queue, for instance).
    pub async fn tick(&self) -> Result<TickReport> {
        let items = match self.source.list_open().await {
            Ok(items) => items,
            Err(err) if err.is_transient() => {
                warn!(%err, source = self.source.name(), "cannot list open items; retrying next tick");
                return Ok(TickReport::default());
            }
            Err(err) => return Err(err),
        };

        let mut report = TickReport {
            listed: items.len(),
            ..TickReport::default()
        };
        let candidates = self.candidates(items).await;
        if candidates.is_empty() {
            debug!(listed = report.listed, "nothing to dispatch");
            return Ok(report);
        }

        let outcomes: Vec<Outcome> = stream::iter(candidates)
            .map(|item| self.dispatch(item))
            .buffer_unordered(self.max_parallel_spawns)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Outcome::Spawned => report.spawned += 1,
                Outcome::Adopted => report.adopted += 1,
                Outcome::Failed => report.failed += 1,
            }
        }
        info!(
            listed = report.listed,
            spawned = report.spawned,
            adopted = report.adopted,
            failed = report.failed,
            "tick complete"
        );
        Ok(report)
    }

    /// Items not yet recorded, deduplicated and capped by `max_active`.
    async fn candidates(&self, items: Vec<WorkItem>) -> Vec<WorkItem> {
        let records = self.records.lock().await;
        let room = if self.max_active == 0 {
            usize::MAX
        } else {
            self.max_active.saturating_sub(records.len())
        };

        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for item in items {
            if records.contains_key(&item.id) || !seen.insert(item.id.clone()) {
                continue;
            }
            if selected.len() == room {
                debug!(max_active = self.max_active, "active limit reached; deferring remaining items");
                break;
            }
            selected.push(item);
        }
        selected
    }

    async fn dispatch(&self, item: WorkItem) -> Outcome {
        let span = info_span!("dispatch", item_id = %item.id, spawner = self.spawner.name());
        async move {
            match self.spawner.find_active(&item.id).await {
                Ok(Some(handle)) => {
                    info!(execution = %handle.id, "execution already running; adopting");
                    self.insert(&item.id, handle).await;
                    return Outcome::Adopted;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(%err, "cannot cross-check platform; skipping item this tick");
                    return Outcome::Failed;
                }
            }

            match self.spawner.spawn(&item, &self.agent).await {
                Ok(handle) => {
                    info!(execution = %handle.id, "execution spawned");
                    self.insert(&item.id, handle).await;
                    Outcome::Spawned
                }
                Err(err) => {
                    warn!(%err, transient = err.is_transient(), "spawn failed");
                    Outcome::Failed
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn insert(&self, item_id: &str, handle: ExecutionHandle) {
        let record = SpawnRecord {
            handle,
            started_at: Utc::now(),
        };
        self.records.lock().await.insert(item_id.to_owned(), record);
    }

    /// Finalize and forget executions that are no longer active, then
    /// finalize finished executions the spawner still holds that no record
    /// tracks. Returns the item IDs released. Entries whose status cannot
    /// be read are kept.
    pub async fn sweep(&self) -> Vec<String> {
        let snapshot: Vec<(String, ExecutionHandle)> = self
            .records
            .lock()
            .await
            .iter()
            .map(|(id, record)| (id.clone(), record.handle.clone()))
            .collect();

        let mut released = Vec::new();
        for (item_id, handle) in snapshot {
            match self.spawner.is_active(&handle).await {
                Ok(true) => {}
                Ok(false) => {
                    self.release(&handle).await;
                    self.records.lock().await.remove(&item_id);
                    released.push(item_id);
                }
                Err(err) => {
                    warn!(%err, item_id, "cannot check execution; keeping record");
                }
            }
        }

        let leftovers = match self.spawner.finished().await {
            Ok(leftovers) => leftovers,
            Err(err) => {
                warn!(%err, "cannot list finished executions");
                return released;
            }
        };
        let tracked: HashSet<String> = self
            .records
            .lock()
            .await
            .values()
            .map(|record| record.handle.id.clone())
            .collect();
        for handle in leftovers {
            if tracked.contains(&handle.id) {
                continue;
            }
            info!(item_id = %handle.item_id, execution = %handle.id, "finalizing untracked execution");
            self.release(&handle).await;
            released.push(handle.item_id);
        }
        released
    }

    async fn release(&self, handle: &ExecutionHandle) {
        match self.spawner.finalize(handle).await {
            Ok(ExecutionOutcome::Failed { reason, output }) => {
                warn!(item_id = %handle.item_id, execution = %handle.id, %reason, "execution failed");
                self.report_failure(&handle.item_id, &reason, &output).await;
            }
            Ok(outcome) => {
                info!(item_id = %handle.item_id, execution = %handle.id, ?outcome, "execution finished");
            }
            Err(err) => {
                warn!(%err, item_id = %handle.item_id, execution = %handle.id, "finalize failed");
            }
        }
    }

    async fn report_failure(&self, item_id: &str, reason: &str, output: &str) {
        let comment = failure_comment(reason, output);
        match self
            .source
            .update_status(item_id, FAILED_STATUS, &comment)
            .await
        {
            Ok(()) => debug!(item_id, source = self.source.name(), "failure reported"),
            Err(err) => warn!(%err, item_id, source = self.source.name(), "cannot report failure"),
        }
    }

    /// Run ticks until `cancel` fires. Sleeps between ticks are cut short
    /// by cancellation (returning immediately) or by the wake notifier.
    ///
    /// # Errors
    ///
    /// Returns a non-transient error raised by [`Orchestrator::tick`].
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            source = self.source.name(),
            spawner = self.spawner.name(),
            interval_secs = self.interval.as_secs(),
            "orchestrator started"
        );
        let mut tick: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if tick % self.sweep_every == 0 {
                self.sweep().await;
            }
            self.tick()
                .instrument(info_span!("orchestrator_tick", tick))
                .await?;
            tick += 1;

            let woken = async {
                match &self.wake {
                    Some(wake) => wake.notified().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
                () = woken => debug!("woken early"),
            }
        }

        info!("orchestrator stopped");
        Ok(())
    }
}

/// Comment posted to the task source for a failed execution.
#[must_use]
pub fn failure_comment(reason: &str, output: &str) -> String {
    let output = output.trim_end();
    if output.is_empty() {
        format!("Agent failed:\n{reason}")
    } else {
        format!("Agent failed:\n{reason}\nOutput:\n{output}")
    }
}
