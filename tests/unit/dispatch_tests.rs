//! Unit tests for the orchestrator loop with in-memory source and spawner.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use recac::config::AgentConfig;
use recac::models::work_item::{NewWorkItem, WorkItem};
use recac::orchestrator::dispatch::{failure_comment, Orchestrator};
use recac::orchestrator::spawner::{ExecutionHandle, ExecutionOutcome, SpawnFuture, Spawner};
use recac::tasks::{TaskSource, FAILED_STATUS};
use recac::{AppError, Result};
use tokio_util::sync::CancellationToken;

// ── Fakes ────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct FakeSource {
    items: Arc<Mutex<Vec<WorkItem>>>,
    failure: Arc<Mutex<Option<fn() -> AppError>>>,
    polls: Arc<Mutex<usize>>,
    reports: Arc<Mutex<Vec<(String, String, String)>>>,
}

impl FakeSource {
    fn with(ids: &[&str]) -> Self {
        let source = Self::default();
        source.set(ids);
        source
    }

    fn set(&self, ids: &[&str]) {
        *self.items.lock().unwrap() = ids.iter().map(|id| WorkItem::new(*id, "task")).collect();
    }

    fn fail_with(&self, make: fn() -> AppError) {
        *self.failure.lock().unwrap() = Some(make);
    }

    fn polls(&self) -> usize {
        *self.polls.lock().unwrap()
    }
}

impl TaskSource for FakeSource {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn list_open(&self) -> Pin<Box<dyn Future<Output = Result<Vec<WorkItem>>> + Send + '_>> {
        *self.polls.lock().unwrap() += 1;
        let result = match *self.failure.lock().unwrap() {
            Some(make) => Err(make()),
            None => Ok(self.items.lock().unwrap().clone()),
        };
        Box::pin(async move { result })
    }

    fn submit(
        &self,
        item: NewWorkItem,
    ) -> Pin<Box<dyn Future<Output = Result<WorkItem>> + Send + '_>> {
        Box::pin(async move { Ok(WorkItem::new("NEW-1", item.title)) })
    }

    fn update_status<'a>(
        &'a self,
        item_id: &'a str,
        status: &'a str,
        comment: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        self.reports
            .lock()
            .unwrap()
            .push((item_id.to_owned(), status.to_owned(), comment.to_owned()));
        Box::pin(async { Ok(()) })
    }
}

#[derive(Clone, Default)]
struct FakeSpawner {
    spawns: Arc<Mutex<HashMap<String, usize>>>,
    active: Arc<Mutex<HashSet<String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    already_running: Arc<Mutex<HashSet<String>>>,
    unreachable: Arc<Mutex<bool>>,
    finalized: Arc<Mutex<Vec<String>>>,
    crashing: Arc<Mutex<HashSet<String>>>,
    leftovers: Arc<Mutex<Vec<ExecutionHandle>>>,
}

impl FakeSpawner {
    fn spawn_count(&self, id: &str) -> usize {
        self.spawns.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    fn total_spawns(&self) -> usize {
        self.spawns.lock().unwrap().values().sum()
    }

    fn finish(&self, id: &str) {
        self.active.lock().unwrap().remove(id);
    }

    fn handle(id: &str) -> ExecutionHandle {
        ExecutionHandle {
            item_id: id.to_owned(),
            id: format!("exec-{id}"),
            started_at: Utc::now(),
            workspace: None,
        }
    }
}

impl Spawner for FakeSpawner {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn spawn<'a>(
        &'a self,
        item: &'a WorkItem,
        _agent: &'a AgentConfig,
    ) -> SpawnFuture<'a, ExecutionHandle> {
        Box::pin(async move {
            *self.spawns.lock().unwrap().entry(item.id.clone()).or_default() += 1;
            if self.failing.lock().unwrap().contains(&item.id) {
                return Err(AppError::Spawn(format!("image pull failed for {}", item.id)));
            }
            self.active.lock().unwrap().insert(item.id.clone());
            Ok(Self::handle(&item.id))
        })
    }

    fn is_active<'a>(&'a self, handle: &'a ExecutionHandle) -> SpawnFuture<'a, bool> {
        Box::pin(async move {
            if *self.unreachable.lock().unwrap() {
                return Err(AppError::Unavailable("daemon down".into()));
            }
            Ok(self.active.lock().unwrap().contains(&handle.item_id))
        })
    }

    fn find_active<'a>(&'a self, item_id: &'a str) -> SpawnFuture<'a, Option<ExecutionHandle>> {
        Box::pin(async move {
            if *self.unreachable.lock().unwrap() {
                return Err(AppError::Unavailable("daemon down".into()));
            }
            Ok(self
                .already_running
                .lock()
                .unwrap()
                .contains(item_id)
                .then(|| Self::handle(item_id)))
        })
    }

    fn finalize<'a>(&'a self, handle: &'a ExecutionHandle) -> SpawnFuture<'a, ExecutionOutcome> {
        Box::pin(async move {
            self.finalized.lock().unwrap().push(handle.item_id.clone());
            self.leftovers.lock().unwrap().retain(|left| left.id != handle.id);
            if self.crashing.lock().unwrap().contains(&handle.item_id) {
                return Ok(ExecutionOutcome::Failed {
                    reason: "container exited with status 2".into(),
                    output: "panic: nil map\n".into(),
                });
            }
            Ok(ExecutionOutcome::Succeeded)
        })
    }

    fn logs<'a>(&'a self, _handle: &'a ExecutionHandle) -> SpawnFuture<'a, String> {
        Box::pin(async move { Ok(String::new()) })
    }

    fn finished(&self) -> SpawnFuture<'_, Vec<ExecutionHandle>> {
        let leftovers = self.leftovers.lock().unwrap().clone();
        Box::pin(async move { Ok(leftovers) })
    }
}

fn orchestrator(
    source: &FakeSource,
    spawner: &FakeSpawner,
) -> Orchestrator<FakeSource, FakeSpawner> {
    Orchestrator::new(source.clone(), spawner.clone(), AgentConfig::default())
        .interval(Duration::from_millis(20))
}

// ── Dedup ────────────────────────────────────────────────────

#[tokio::test]
async fn two_ticks_spawn_an_active_item_once() {
    let source = FakeSource::with(&["T-1"]);
    let spawner = FakeSpawner::default();
    let orch = orchestrator(&source, &spawner);

    let first = orch.tick().await.unwrap();
    let second = orch.tick().await.unwrap();

    assert_eq!(first.spawned, 1);
    assert_eq!(second.spawned, 0);
    assert_eq!(spawner.spawn_count("T-1"), 1);
    assert!(orch.record("T-1").await.is_some());
}

#[tokio::test]
async fn duplicate_ids_in_one_listing_spawn_once() {
    let source = FakeSource::with(&["T-1", "T-1", "T-2"]);
    let spawner = FakeSpawner::default();
    let orch = orchestrator(&source, &spawner);

    let report = orch.tick().await.unwrap();

    assert_eq!(report.listed, 3);
    assert_eq!(report.spawned, 2);
    assert_eq!(spawner.spawn_count("T-1"), 1);
}

#[tokio::test]
async fn failed_spawn_is_not_recorded_and_retries_next_tick() {
    let source = FakeSource::with(&["T-1", "T-2"]);
    let spawner = FakeSpawner::default();
    spawner.failing.lock().unwrap().insert("T-1".into());
    let orch = orchestrator(&source, &spawner);

    let report = orch.tick().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.spawned, 1);
    assert!(orch.record("T-1").await.is_none());
    assert!(orch.record("T-2").await.is_some());

    spawner.failing.lock().unwrap().clear();
    orch.tick().await.unwrap();
    assert_eq!(spawner.spawn_count("T-1"), 2);
    assert_eq!(spawner.spawn_count("T-2"), 1);
}

#[tokio::test]
async fn running_execution_on_platform_is_adopted() {
    let source = FakeSource::with(&["T-9"]);
    let spawner = FakeSpawner::default();
    spawner.already_running.lock().unwrap().insert("T-9".into());
    spawner.active.lock().unwrap().insert("T-9".into());
    let orch = orchestrator(&source, &spawner);

    let report = orch.tick().await.unwrap();

    assert_eq!(report.adopted, 1);
    assert_eq!(spawner.spawn_count("T-9"), 0);
    assert_eq!(orch.record("T-9").await.unwrap().handle.id, "exec-T-9");
}

#[tokio::test]
async fn unreachable_platform_skips_dispatch() {
    let source = FakeSource::with(&["T-1"]);
    let spawner = FakeSpawner::default();
    *spawner.unreachable.lock().unwrap() = true;
    let orch = orchestrator(&source, &spawner);

    let report = orch.tick().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(spawner.total_spawns(), 0);
    assert_eq!(orch.active_count().await, 0);
}

// ── Limits ───────────────────────────────────────────────────

#[tokio::test]
async fn max_active_defers_extra_items() {
    let source = FakeSource::with(&["A", "B", "C"]);
    let spawner = FakeSpawner::default();
    let orch = orchestrator(&source, &spawner).max_active(2);

    orch.tick().await.unwrap();
    assert_eq!(spawner.total_spawns(), 2);
    assert_eq!(spawner.spawn_count("C"), 0);

    spawner.finish("A");
    source.set(&["B", "C"]);
    orch.sweep().await;
    orch.tick().await.unwrap();
    assert_eq!(spawner.spawn_count("C"), 1);
    assert_eq!(orch.active_count().await, 2);
}

#[tokio::test]
async fn single_parallel_spawn_still_dispatches_everything() {
    let source = FakeSource::with(&["A", "B", "C", "D"]);
    let spawner = FakeSpawner::default();
    let orch = orchestrator(&source, &spawner).max_parallel_spawns(1);

    let report = orch.tick().await.unwrap();
    assert_eq!(report.spawned, 4);
}

// ── Sweep ────────────────────────────────────────────────────

#[tokio::test]
async fn sweep_finalizes_finished_executions() {
    let source = FakeSource::with(&["T-1", "T-2"]);
    let spawner = FakeSpawner::default();
    let orch = orchestrator(&source, &spawner);
    orch.tick().await.unwrap();

    spawner.finish("T-1");
    let released = orch.sweep().await;

    assert_eq!(released, vec!["T-1".to_owned()]);
    assert_eq!(*spawner.finalized.lock().unwrap(), vec!["T-1".to_owned()]);
    assert!(orch.record("T-1").await.is_none());
    assert!(orch.record("T-2").await.is_some());
}

#[tokio::test]
async fn failed_execution_is_reported_to_the_source() {
    let source = FakeSource::with(&["T-1", "T-2"]);
    let spawner = FakeSpawner::default();
    spawner.crashing.lock().unwrap().insert("T-1".into());
    let orch = orchestrator(&source, &spawner);
    orch.tick().await.unwrap();

    spawner.finish("T-1");
    spawner.finish("T-2");
    orch.sweep().await;

    let reports = source.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    let (item_id, status, comment) = &reports[0];
    assert_eq!(item_id, "T-1");
    assert_eq!(status, FAILED_STATUS);
    assert_eq!(
        comment,
        "Agent failed:\ncontainer exited with status 2\nOutput:\npanic: nil map"
    );
}

#[tokio::test]
async fn untracked_finished_executions_are_finalized() {
    let source = FakeSource::with(&["T-1"]);
    let spawner = FakeSpawner::default();
    let orch = orchestrator(&source, &spawner);
    orch.tick().await.unwrap();

    spawner.crashing.lock().unwrap().insert("OLD-7".into());
    spawner.leftovers.lock().unwrap().extend([
        FakeSpawner::handle("OLD-7"),
        FakeSpawner::handle("T-1"),
    ]);
    let released = orch.sweep().await;

    assert_eq!(released, vec!["OLD-7".to_owned()]);
    assert_eq!(*spawner.finalized.lock().unwrap(), vec!["OLD-7".to_owned()]);
    assert_eq!(source.reports.lock().unwrap()[0].0, "OLD-7");
    assert!(orch.record("T-1").await.is_some());
}

#[test]
fn failure_comment_omits_empty_output() {
    assert_eq!(failure_comment("job x failed", "  \n"), "Agent failed:\njob x failed");
}

#[tokio::test]
async fn finished_item_respawns_only_while_still_open() {
    let source = FakeSource::with(&["T-1"]);
    let spawner = FakeSpawner::default();
    let orch = orchestrator(&source, &spawner);
    orch.tick().await.unwrap();

    spawner.finish("T-1");
    source.set(&[]);
    orch.sweep().await;
    orch.tick().await.unwrap();

    assert_eq!(spawner.spawn_count("T-1"), 1);
    assert_eq!(orch.active_count().await, 0);
}

#[tokio::test]
async fn sweep_keeps_records_it_cannot_check() {
    let source = FakeSource::with(&["T-1"]);
    let spawner = FakeSpawner::default();
    let orch = orchestrator(&source, &spawner);
    orch.tick().await.unwrap();

    *spawner.unreachable.lock().unwrap() = true;
    assert!(orch.sweep().await.is_empty());
    assert!(orch.record("T-1").await.is_some());
}

// ── Source failures ──────────────────────────────────────────

#[tokio::test]
async fn transient_source_failure_is_swallowed() {
    let source = FakeSource::default();
    source.fail_with(|| AppError::Unavailable("tracker timeout".into()));
    let spawner = FakeSpawner::default();
    let orch = orchestrator(&source, &spawner);

    let report = orch.tick().await.unwrap();
    assert_eq!(report.listed, 0);
}

#[tokio::test]
async fn fatal_source_failure_propagates() {
    let source = FakeSource::default();
    source.fail_with(|| AppError::Store("corrupt queue".into()));
    let spawner = FakeSpawner::default();
    let orch = orchestrator(&source, &spawner);

    assert!(matches!(orch.tick().await, Err(AppError::Store(_))));
}

// ── Run loop ─────────────────────────────────────────────────

#[tokio::test]
async fn run_returns_promptly_on_cancel() {
    let source = FakeSource::with(&["T-1"]);
    let spawner = FakeSpawner::default();
    let orch = orchestrator(&source, &spawner).interval(Duration::from_secs(3600));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), orch.run(cancel))
        .await
        .expect("run should stop on cancellation")
        .unwrap();
    assert_eq!(spawner.spawn_count("T-1"), 1);
}

#[tokio::test]
async fn run_polls_repeatedly_without_respawning() {
    let source = FakeSource::with(&["T-1"]);
    let spawner = FakeSpawner::default();
    let orch = orchestrator(&source, &spawner);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });
    orch.run(cancel).await.unwrap();

    assert!(source.polls() >= 2);
    assert_eq!(spawner.spawn_count("T-1"), 1);
}

#[tokio::test]
async fn wake_cuts_the_sleep_short() {
    let source = FakeSource::with(&[]);
    let spawner = FakeSpawner::default();
    let wake = Arc::new(tokio::sync::Notify::new());
    let orch = orchestrator(&source, &spawner)
        .interval(Duration::from_secs(3600))
        .with_wake(Arc::clone(&wake));
    let cancel = CancellationToken::new();

    let feeder = source.clone();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        feeder.set(&["LATE-1"]);
        wake.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), orch.run(cancel))
        .await
        .expect("run should stop on cancellation")
        .unwrap();
    assert_eq!(spawner.spawn_count("LATE-1"), 1);
}
