//! Integration tests for detached session lifecycle with real processes.

use std::path::Path;
use std::time::{Duration, Instant};

use recac::models::session::{Session, SessionStatus};
use recac::orchestrator::process::{is_process_running, signal_group, SessionSignal};
use recac::orchestrator::session_manager::{LocalSessionManager, SessionManager, StartRequest};
use recac::persistence::session_store::SessionStore;
use recac::AppError;
use tempfile::TempDir;

use super::test_helpers::{git, head, init_repo};

struct Fixture {
    _state: TempDir,
    workspace: TempDir,
    manager: LocalSessionManager,
}

fn fixture() -> Fixture {
    let state = tempfile::tempdir().unwrap();
    let manager = LocalSessionManager::new(SessionStore::open(state.path().join("sessions")).unwrap())
        .stop_grace(Duration::from_millis(500));
    Fixture {
        _state: state,
        workspace: tempfile::tempdir().unwrap(),
        manager,
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| (*part).to_owned()).collect()
}

fn start(manager: &LocalSessionManager, name: &str, workspace: &Path, command: &[&str]) -> Session {
    manager
        .start_session(StartRequest::new(name, "do the thing", argv(command), workspace))
        .unwrap()
}

/// Poll until the session is no longer running.
fn wait_finished(manager: &LocalSessionManager, name: &str) -> Session {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let session = manager.load_session(name).unwrap();
        if session.status != SessionStatus::Running {
            return session;
        }
        assert!(Instant::now() < deadline, "session {name} never finished");
        std::thread::sleep(Duration::from_millis(50));
    }
}

// ── Start and stop ───────────────────────────────────────────

#[test]
fn start_list_and_stop() {
    let fx = fixture();
    let started = start(&fx.manager, "worker", fx.workspace.path(), &["sleep", "30"]);

    assert_eq!(started.status, SessionStatus::Running);
    assert!(started.pid > 0);
    assert!(is_process_running(started.pid));
    assert!(started.start_commit_sha.is_empty());

    let listed = fx.manager.list_sessions().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "worker");
    assert_eq!(listed[0].goal, "do the thing");

    let stopped = fx.manager.stop_session("worker").unwrap();
    assert_eq!(stopped.status, SessionStatus::Stopped);
    assert!(stopped.end_time.is_some());
    assert!(!is_process_running(started.pid));
}

#[test]
fn stop_is_idempotent() {
    let fx = fixture();
    start(&fx.manager, "once", fx.workspace.path(), &["sleep", "30"]);

    let first = fx.manager.stop_session("once").unwrap();
    let second = fx.manager.stop_session("once").unwrap();

    assert_eq!(second.status, SessionStatus::Stopped);
    assert_eq!(first.end_time, second.end_time);
}

#[test]
fn duplicate_running_name_is_rejected() {
    let fx = fixture();
    start(&fx.manager, "dup", fx.workspace.path(), &["sleep", "30"]);

    let err = fx
        .manager
        .start_session(StartRequest::new("dup", "", argv(&["sleep", "30"]), fx.workspace.path()))
        .unwrap_err();
    assert!(matches!(err, AppError::DuplicateSession(_)));

    fx.manager.stop_session("dup").unwrap();
    let again = start(&fx.manager, "dup", fx.workspace.path(), &["sleep", "30"]);
    assert_eq!(again.status, SessionStatus::Running);
    fx.manager.stop_session("dup").unwrap();
}

#[test]
fn unknown_session_is_not_found() {
    let fx = fixture();
    assert!(matches!(
        fx.manager.stop_session("ghost"),
        Err(AppError::SessionNotFound(_))
    ));
}

#[test]
fn failed_launch_leaves_no_record() {
    let fx = fixture();
    let err = fx
        .manager
        .start_session(StartRequest::new(
            "broken",
            "",
            Vec::new(),
            fx.workspace.path(),
        ))
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
    assert!(fx.manager.list_sessions().unwrap().is_empty());
}

// ── Pause and resume ─────────────────────────────────────────

#[test]
fn pause_and_resume_toggle_the_flag() {
    let fx = fixture();
    start(&fx.manager, "nap", fx.workspace.path(), &["sleep", "30"]);

    let paused = fx.manager.pause_session("nap").unwrap();
    assert!(paused.paused);
    assert_eq!(paused.status, SessionStatus::Running);
    assert_eq!(paused.display_status(), SessionStatus::Paused);

    let resumed = fx.manager.resume_session("nap").unwrap();
    assert!(!resumed.paused);

    assert!(matches!(
        fx.manager.resume_session("nap"),
        Err(AppError::InvalidState(_))
    ));

    fx.manager.pause_session("nap").unwrap();
    let stopped = fx.manager.stop_session("nap").unwrap();
    assert_eq!(stopped.status, SessionStatus::Stopped);
    assert!(!stopped.paused);
}

#[test]
fn pausing_a_finished_session_fails() {
    let fx = fixture();
    start(&fx.manager, "short", fx.workspace.path(), &["true"]);
    wait_finished(&fx.manager, "short");

    assert!(matches!(
        fx.manager.pause_session("short"),
        Err(AppError::NotRunning(_))
    ));
}

#[test]
fn pausing_a_stopped_session_changes_nothing() {
    let fx = fixture();
    start(&fx.manager, "halted", fx.workspace.path(), &["sleep", "30"]);
    let stopped = fx.manager.stop_session("halted").unwrap();

    assert!(matches!(
        fx.manager.pause_session("halted"),
        Err(AppError::NotRunning(_))
    ));
    assert_eq!(fx.manager.load_session("halted").unwrap(), stopped);
}

// ── Reconciliation ───────────────────────────────────────────

#[test]
fn clean_exit_reconciles_to_completed() {
    let fx = fixture();
    start(&fx.manager, "ok", fx.workspace.path(), &["true"]);

    let session = wait_finished(&fx.manager, "ok");

    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.error.is_empty());
    assert!(session.end_time.is_some());
}

#[test]
fn failing_exit_reconciles_to_error() {
    let fx = fixture();
    start(&fx.manager, "bad", fx.workspace.path(), &["sh", "-c", "exit 3"]);

    let session = wait_finished(&fx.manager, "bad");

    assert_eq!(session.status, SessionStatus::Error);
    assert_eq!(session.error, "process exited with status 3");
}

#[test]
fn reconciliation_keeps_start_time() {
    let fx = fixture();
    let started = start(&fx.manager, "timed", fx.workspace.path(), &["true"]);

    let session = wait_finished(&fx.manager, "timed");

    assert_eq!(session.start_time, started.start_time);
    assert!(session.end_time.unwrap() >= session.start_time);
}

#[test]
fn killed_group_reconciles_to_error_without_status() {
    let fx = fixture();
    let started = start(&fx.manager, "killed", fx.workspace.path(), &["sleep", "30"]);

    signal_group(started.pid, SessionSignal::Kill).unwrap();
    let session = wait_finished(&fx.manager, "killed");

    assert_eq!(session.status, SessionStatus::Error);
    assert_eq!(
        session.error,
        format!("process {} exited without recording a status", started.pid)
    );
    assert_eq!(session.start_time, started.start_time);
}

#[test]
fn listing_persists_reconciled_status() {
    let fx = fixture();
    start(&fx.manager, "quick", fx.workspace.path(), &["true"]);
    wait_finished(&fx.manager, "quick");

    let listed = fx.manager.list_sessions().unwrap();
    assert_eq!(listed[0].status, SessionStatus::Completed);
    let raw = fx.manager.store().load("quick").unwrap();
    assert_eq!(raw.status, SessionStatus::Completed);
}

// ── Logs ─────────────────────────────────────────────────────

#[test]
fn log_captures_output_and_tails() {
    let fx = fixture();
    start(
        &fx.manager,
        "chatty",
        fx.workspace.path(),
        &["sh", "-c", "echo one; echo two; echo three >&2"],
    );
    wait_finished(&fx.manager, "chatty");

    let all = fx.manager.session_log_content("chatty", 0).unwrap();
    assert!(all.contains("one\ntwo\n"));
    assert!(all.contains("three"));
    assert_eq!(fx.manager.session_log_content("chatty", 1).unwrap(), "three\n");
    assert!(fx.manager.session_logs("chatty").unwrap().ends_with("chatty.log"));
}

// ── Rename, remove, archive ──────────────────────────────────

#[test]
fn rename_moves_record_and_log() {
    let fx = fixture();
    start(&fx.manager, "old", fx.workspace.path(), &["sh", "-c", "echo moved"]);
    wait_finished(&fx.manager, "old");

    let renamed = fx.manager.rename_session("old", "new").unwrap();

    assert_eq!(renamed.name, "new");
    assert!(matches!(
        fx.manager.load_session("old"),
        Err(AppError::SessionNotFound(_))
    ));
    assert!(fx
        .manager
        .session_log_content("new", 0)
        .unwrap()
        .contains("moved"));
}

#[test]
fn running_session_cannot_be_renamed() {
    let fx = fixture();
    start(&fx.manager, "busy", fx.workspace.path(), &["sleep", "30"]);
    assert!(matches!(
        fx.manager.rename_session("busy", "other"),
        Err(AppError::SessionRunning(_))
    ));
    fx.manager.stop_session("busy").unwrap();
}

#[test]
fn remove_requires_force_while_running() {
    let fx = fixture();
    let session = start(&fx.manager, "doomed", fx.workspace.path(), &["sleep", "30"]);

    assert!(matches!(
        fx.manager.remove_session("doomed", false),
        Err(AppError::SessionRunning(_))
    ));
    fx.manager.remove_session("doomed", true).unwrap();

    assert!(!is_process_running(session.pid));
    assert!(fx.manager.list_sessions().unwrap().is_empty());
    assert!(!session.log_file.exists());
}

#[test]
fn archive_round_trip_restores_prior_status() {
    let fx = fixture();
    start(&fx.manager, "keep", fx.workspace.path(), &["true"]);
    wait_finished(&fx.manager, "keep");

    let archived = fx.manager.archive_session("keep").unwrap();
    assert_eq!(archived.status, SessionStatus::Archived);
    assert_eq!(archived.archived_from, Some(SessionStatus::Completed));
    assert!(fx.manager.list_sessions().unwrap().is_empty());
    assert_eq!(fx.manager.list_archived_sessions().unwrap().len(), 1);

    let restored = fx.manager.unarchive_session("keep").unwrap();
    assert_eq!(restored.status, SessionStatus::Completed);
    assert_eq!(restored.archived_from, None);
    assert!(fx.manager.list_archived_sessions().unwrap().is_empty());
    assert_eq!(fx.manager.load_session("keep").unwrap().status, SessionStatus::Completed);
}

#[test]
fn running_session_cannot_be_archived() {
    let fx = fixture();
    start(&fx.manager, "live", fx.workspace.path(), &["sleep", "30"]);
    assert!(matches!(
        fx.manager.archive_session("live"),
        Err(AppError::SessionRunning(_))
    ));
    fx.manager.stop_session("live").unwrap();
}

// ── Git integration ──────────────────────────────────────────

#[test]
fn dirty_workspace_is_refused_unless_allowed() {
    let fx = fixture();
    let repo = init_repo();
    std::fs::write(repo.path().join("wip.txt"), "uncommitted").unwrap();

    let err = fx
        .manager
        .start_session(StartRequest::new("dirty", "", argv(&["true"]), repo.path()))
        .unwrap_err();
    assert!(matches!(err, AppError::WorkspaceDirty(_)));
    assert!(fx.manager.list_sessions().unwrap().is_empty());

    let state = tempfile::tempdir().unwrap();
    let lenient = LocalSessionManager::new(SessionStore::open(state.path()).unwrap()).allow_dirty(true);
    let session = start(&lenient, "dirty", repo.path(), &["true"]);
    assert_eq!(session.start_commit_sha, head(repo.path()));
}

#[test]
fn dirty_restart_keeps_finished_record() {
    let fx = fixture();
    let repo = init_repo();
    start(&fx.manager, "s1", repo.path(), &["sh", "-c", "echo first run"]);
    let finished = wait_finished(&fx.manager, "s1");
    assert_eq!(finished.status, SessionStatus::Completed);

    std::fs::write(repo.path().join("wip.txt"), "uncommitted").unwrap();
    let err = fx
        .manager
        .start_session(StartRequest::new("s1", "", argv(&["true"]), repo.path()))
        .unwrap_err();

    assert!(matches!(err, AppError::WorkspaceDirty(_)));
    assert_eq!(fx.manager.load_session("s1").unwrap(), finished);
    assert!(fx
        .manager
        .session_log_content("s1", 0)
        .unwrap()
        .contains("first run"));
}

#[test]
fn restart_replaces_finished_record_and_log() {
    let fx = fixture();
    start(&fx.manager, "again", fx.workspace.path(), &["sh", "-c", "echo first run"]);
    let first = wait_finished(&fx.manager, "again");

    start(&fx.manager, "again", fx.workspace.path(), &["sh", "-c", "echo second run"]);
    let second = wait_finished(&fx.manager, "again");

    assert_ne!(second.pid, first.pid);
    let log = fx.manager.session_log_content("again", 0).unwrap();
    assert!(log.contains("second run"));
    assert!(!log.contains("first run"));
    let leftovers: Vec<_> = std::fs::read_dir(fx.manager.store().root())
        .unwrap()
        .flatten()
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "prev"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn agent_state_file_does_not_count_as_dirty() {
    let fx = fixture();
    let repo = init_repo();
    std::fs::write(repo.path().join(".agent_state.json"), r#"{"iteration": 2}"#).unwrap();

    start(&fx.manager, "stateful", repo.path(), &["true"]);
    wait_finished(&fx.manager, "stateful");

    let state = fx.manager.agent_state("stateful").unwrap().unwrap();
    assert_eq!(state["iteration"], 2);
}

#[test]
fn diff_stat_spans_the_session() {
    let fx = fixture();
    let repo = init_repo();
    let before = head(repo.path());

    start(
        &fx.manager,
        "coder",
        repo.path(),
        &[
            "sh",
            "-c",
            "echo feature > feature.txt && git add feature.txt && git -c user.name=t -c user.email=t@e commit -q -m feature",
        ],
    );
    let session = wait_finished(&fx.manager, "coder");

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.start_commit_sha, before);
    assert_eq!(session.end_commit_sha, head(repo.path()));
    assert_ne!(session.end_commit_sha, before);

    let stat = fx.manager.session_git_diff_stat("coder").unwrap();
    assert!(stat.contains("feature.txt"));
    assert_eq!(git(repo.path(), &["log", "-1", "--format=%s"]), "feature");
}
