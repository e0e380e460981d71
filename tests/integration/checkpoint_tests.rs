//! Integration tests for checkpoint, rollback, and bisect against real
//! git repositories.

use std::path::Path;

use recac::agent::HostCliAgent;
use recac::git::{GitCli, GitClient};
use recac::models::session::{Session, SessionStatus};
use recac::orchestrator::checkpoint_manager::{
    bisect, checkpoint, checkpoint_message, find_checkpoint, interactive_rollback,
    rollback_session, rollback_to_iteration, rollback_with_mode, AgentJudge, BisectRequest,
    ExitCodeJudge, Prompter, RollbackMode,
};
use recac::orchestrator::session_manager::{LocalSessionManager, SessionManager};
use recac::persistence::session_store::SessionStore;
use recac::{AppError, Result};

use super::test_helpers::{git, head, init_repo, write_and_checkpoint};

fn read_state(root: &Path) -> String {
    std::fs::read_to_string(root.join("state.txt")).unwrap()
}

// ── Checkpoint and rollback ──────────────────────────────────

#[test]
fn checkpoint_commits_with_iteration_subject() {
    let repo = init_repo();
    let sha = write_and_checkpoint(repo.path(), 3, "three");

    assert_eq!(sha, head(repo.path()));
    assert_eq!(
        git(repo.path(), &["log", "-1", "--format=%s"]),
        checkpoint_message(3)
    );
    assert!(GitCli::default()
        .status_porcelain(repo.path())
        .unwrap()
        .is_empty());
}

#[test]
fn checkpoint_without_changes_still_commits() {
    let repo = init_repo();
    let before = head(repo.path());
    let sha = checkpoint(&GitCli::default(), repo.path(), 1).unwrap();
    assert_ne!(sha, before);
}

#[test]
fn rollback_restores_checkpointed_content() {
    let repo = init_repo();
    let root = repo.path();
    let first = write_and_checkpoint(root, 1, "v1");
    write_and_checkpoint(root, 2, "v2");
    std::fs::write(root.join("state.txt"), "scratch").unwrap();

    let sha = rollback_to_iteration(&GitCli::default(), root, 1).unwrap();

    assert_eq!(sha, first);
    assert_eq!(head(root), first);
    assert_eq!(read_state(root), "v1");
}

#[test]
fn missing_iteration_is_not_found_and_leaves_tree_alone() {
    let repo = init_repo();
    let root = repo.path();
    let current = write_and_checkpoint(root, 1, "v1");

    let err = rollback_to_iteration(&GitCli::default(), root, 7).unwrap_err();

    assert!(matches!(err, AppError::CheckpointNotFound(_)));
    assert_eq!(head(root), current);
}

#[test]
fn iteration_one_does_not_match_iteration_ten() {
    let repo = init_repo();
    let root = repo.path();
    let one = write_and_checkpoint(root, 1, "v1");
    let ten = write_and_checkpoint(root, 10, "v10");

    let git_client = GitCli::default();
    assert_eq!(find_checkpoint(&git_client, root, 1).unwrap(), one);
    assert_eq!(find_checkpoint(&git_client, root, 10).unwrap(), ten);
}

#[test]
fn latest_commit_for_an_iteration_wins() {
    let repo = init_repo();
    let root = repo.path();
    write_and_checkpoint(root, 4, "early");
    let later = write_and_checkpoint(root, 4, "late");

    assert_eq!(find_checkpoint(&GitCli::default(), root, 4).unwrap(), later);
}

#[test]
fn branch_rollback_keeps_the_original_branch() {
    let repo = init_repo();
    let root = repo.path();
    let original = git(root, &["rev-parse", "--abbrev-ref", "HEAD"]);
    let first = write_and_checkpoint(root, 1, "v1");
    let second = write_and_checkpoint(root, 2, "v2");

    let outcome = rollback_with_mode(
        &GitCli::default(),
        root,
        1,
        &RollbackMode::Branch(Some("retry-from-1".into())),
    )
    .unwrap();

    assert_eq!(outcome.sha, first);
    assert_eq!(outcome.branch.as_deref(), Some("retry-from-1"));
    assert_eq!(git(root, &["rev-parse", "--abbrev-ref", "HEAD"]), "retry-from-1");
    assert_eq!(read_state(root), "v1");
    assert_eq!(git(root, &["rev-parse", original.as_str()]), second);
}

#[test]
fn generated_branch_name_mentions_iteration() {
    let repo = init_repo();
    let root = repo.path();
    write_and_checkpoint(root, 2, "v2");

    let outcome =
        rollback_with_mode(&GitCli::default(), root, 2, &RollbackMode::Branch(None)).unwrap();

    assert!(outcome
        .branch
        .unwrap()
        .starts_with("rollback/iteration-2-"));
}

// ── Session-aware rollback ───────────────────────────────────

fn manager(dir: &Path) -> LocalSessionManager {
    LocalSessionManager::new(SessionStore::open(dir.join("sessions")).unwrap())
}

fn tracked(manager: &LocalSessionManager, name: &str, workspace: &Path, status: SessionStatus) {
    let mut session = Session::new(name, "goal", workspace.to_path_buf(), workspace.join("x.log"));
    session.status = status;
    if status == SessionStatus::Running {
        session.pid = i32::try_from(std::process::id()).unwrap();
    }
    manager.track_session(&session).unwrap();
}

#[test]
fn running_session_needs_force() {
    let repo = init_repo();
    let state = tempfile::tempdir().unwrap();
    let sessions = manager(state.path());
    write_and_checkpoint(repo.path(), 1, "v1");
    let current = write_and_checkpoint(repo.path(), 2, "v2");
    tracked(&sessions, "busy", repo.path(), SessionStatus::Running);

    let git_client = GitCli::default();
    let err = rollback_session(&sessions, &git_client, "busy", 1, &RollbackMode::Hard, false)
        .unwrap_err();
    assert!(matches!(err, AppError::SessionRunning(_)));
    assert_eq!(head(repo.path()), current);

    rollback_session(&sessions, &git_client, "busy", 1, &RollbackMode::Hard, true).unwrap();
    assert_eq!(read_state(repo.path()), "v1");
}

struct ScriptedPrompter {
    pick: Option<usize>,
    confirm: bool,
    questions: Vec<String>,
}

impl Prompter for ScriptedPrompter {
    fn select(&mut self, question: &str, _options: &[String]) -> Result<Option<usize>> {
        self.questions.push(question.to_owned());
        Ok(self.pick)
    }

    fn confirm(&mut self, question: &str) -> Result<bool> {
        self.questions.push(question.to_owned());
        Ok(self.confirm)
    }
}

#[test]
fn interactive_rollback_declined_changes_nothing() {
    let repo = init_repo();
    let state = tempfile::tempdir().unwrap();
    let sessions = manager(state.path());
    write_and_checkpoint(repo.path(), 1, "v1");
    let current = write_and_checkpoint(repo.path(), 2, "v2");
    tracked(&sessions, "done", repo.path(), SessionStatus::Completed);

    let mut prompter = ScriptedPrompter {
        pick: Some(0),
        confirm: false,
        questions: Vec::new(),
    };
    let outcome =
        interactive_rollback(&sessions, &GitCli::default(), &mut prompter, None, 1, false)
            .unwrap();

    assert!(outcome.is_none());
    assert_eq!(prompter.questions.len(), 2);
    assert_eq!(head(repo.path()), current);
}

#[test]
fn interactive_rollback_confirmed_creates_branch() {
    let repo = init_repo();
    let state = tempfile::tempdir().unwrap();
    let sessions = manager(state.path());
    let first = write_and_checkpoint(repo.path(), 1, "v1");
    write_and_checkpoint(repo.path(), 2, "v2");
    tracked(&sessions, "done", repo.path(), SessionStatus::Stopped);

    let mut prompter = ScriptedPrompter {
        pick: None,
        confirm: true,
        questions: Vec::new(),
    };
    let outcome = interactive_rollback(
        &sessions,
        &GitCli::default(),
        &mut prompter,
        Some("done"),
        1,
        false,
    )
    .unwrap()
    .unwrap();

    assert_eq!(outcome.sha, first);
    assert!(outcome.branch.is_some());
    assert_eq!(prompter.questions.len(), 1);
    assert_eq!(read_state(repo.path()), "v1");
}

#[test]
fn interactive_rollback_without_sessions() {
    let repo = init_repo();
    let state = tempfile::tempdir().unwrap();
    let sessions = manager(state.path());
    let mut prompter = ScriptedPrompter {
        pick: Some(0),
        confirm: true,
        questions: Vec::new(),
    };

    let err = interactive_rollback(&sessions, &GitCli::default(), &mut prompter, None, 1, false)
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    drop(repo);
}

// ── Bisect ───────────────────────────────────────────────────

/// Five checkpoints; the third introduces the regression.
fn regression_repo() -> (tempfile::TempDir, Vec<String>) {
    let repo = init_repo();
    let shas = ["ok", "ok", "broken", "broken", "broken"]
        .iter()
        .zip(1..)
        .map(|(content, iteration)| write_and_checkpoint(repo.path(), iteration, content))
        .collect();
    (repo, shas)
}

#[tokio::test]
async fn bisect_with_exit_codes_finds_first_bad_commit() {
    let (repo, shas) = regression_repo();
    let request = BisectRequest {
        workspace: repo.path().to_path_buf(),
        good: shas[0].clone(),
        bad: shas[4].clone(),
        probe: "grep -q ok state.txt".into(),
        keep_state: false,
    };

    let found = bisect(&GitCli::default(), &request, &mut ExitCodeJudge)
        .await
        .unwrap();

    assert_eq!(found, shas[2]);
    assert_eq!(head(repo.path()), shas[4]);
}

#[cfg(unix)]
#[tokio::test]
async fn bisect_with_agent_judge() {
    let (repo, shas) = regression_repo();
    let agent = HostCliAgent::new(
        "/bin/sh",
        vec![
            "-c".into(),
            r#"case "$1" in *"Some(0)"*) echo GOOD ;; *) echo BAD ;; esac"#.into(),
            "judge".into(),
        ],
    );
    let mut judge = AgentJudge::new(agent, "state.txt says ok");
    let request = BisectRequest {
        workspace: repo.path().to_path_buf(),
        good: shas[0].clone(),
        bad: shas[4].clone(),
        probe: "grep ok state.txt".into(),
        keep_state: false,
    };

    let found = bisect(&GitCli::default(), &request, &mut judge).await.unwrap();
    assert_eq!(found, shas[2]);
}

#[tokio::test]
async fn bisect_refuses_dirty_tree() {
    let (repo, shas) = regression_repo();
    std::fs::write(repo.path().join("scratch.txt"), "wip").unwrap();
    let request = BisectRequest {
        workspace: repo.path().to_path_buf(),
        good: shas[0].clone(),
        bad: shas[4].clone(),
        probe: "true".into(),
        keep_state: false,
    };

    let err = bisect(&GitCli::default(), &request, &mut ExitCodeJudge)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::WorkspaceDirty(_)));
    assert_eq!(head(repo.path()), shas[4]);
}
