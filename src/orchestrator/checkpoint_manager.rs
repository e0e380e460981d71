//! Git-backed checkpoints, rollback, and bisect.
//!
//! Each agent iteration is committed with the subject
//! `chore: progress update (iteration N)`. Lookup matches that subject
//! exactly, newest first, so rollback always lands on the latest commit for
//! an iteration.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::agent::Agent;
use crate::git::GitClient;
use crate::models::session::{Session, SessionStatus};
use crate::orchestrator::session_manager::SessionManager;
use crate::{AppError, Result};

/// Upper bound on bisect steps; git needs about log2(commits).
const MAX_BISECT_STEPS: usize = 64;

/// Commit subject for the checkpoint of `iteration`.
#[must_use]
pub fn checkpoint_message(iteration: u32) -> String {
    format!("chore: progress update (iteration {iteration})")
}

/// Commit the current workspace state as the checkpoint for `iteration`.
///
/// # Errors
///
/// Returns `AppError::Git` if staging or committing fails.
pub fn checkpoint(git: &dyn GitClient, workspace: &Path, iteration: u32) -> Result<String> {
    let span = info_span!("checkpoint", workspace = %workspace.display(), iteration);
    let _guard = span.enter();

    let sha = git.commit_all(workspace, &checkpoint_message(iteration))?;
    info!(%sha, "checkpoint committed");
    Ok(sha)
}

/// Most recent commit carrying the checkpoint subject for `iteration`.
///
/// # Errors
///
/// Returns `AppError::CheckpointNotFound` if no commit matches.
pub fn find_checkpoint(git: &dyn GitClient, workspace: &Path, iteration: u32) -> Result<String> {
    let wanted = checkpoint_message(iteration);
    git.log(workspace)?
        .into_iter()
        .find(|commit| commit.subject == wanted)
        .map(|commit| commit.sha)
        .ok_or_else(|| {
            AppError::CheckpointNotFound(format!(
                "iteration {iteration} in {}",
                workspace.display()
            ))
        })
}

/// How a rollback treats the current branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackMode {
    /// `git reset --hard` to the checkpoint; uncommitted work is lost.
    Hard,
    /// Check out a new branch at the checkpoint; the prior branch is kept.
    /// `None` picks `rollback/iteration-N-<timestamp>`.
    Branch(Option<String>),
}

/// Where a rollback left the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    /// Checkpoint commit now at `HEAD`.
    pub sha: String,
    /// Branch created for a non-destructive rollback.
    pub branch: Option<String>,
}

/// Resolve the checkpoint for `iteration` and hard-reset the workspace to it.
///
/// # Errors
///
/// Returns `AppError::CheckpointNotFound` or `AppError::Git`.
pub fn rollback_to_iteration(
    git: &dyn GitClient,
    workspace: &Path,
    iteration: u32,
) -> Result<String> {
    rollback_with_mode(git, workspace, iteration, &RollbackMode::Hard).map(|outcome| outcome.sha)
}

/// Roll back using the given mode.
///
/// # Errors
///
/// Returns `AppError::CheckpointNotFound` or `AppError::Git`.
pub fn rollback_with_mode(
    git: &dyn GitClient,
    workspace: &Path,
    iteration: u32,
    mode: &RollbackMode,
) -> Result<RollbackOutcome> {
    let span = info_span!("rollback", workspace = %workspace.display(), iteration);
    let _guard = span.enter();

    let sha = find_checkpoint(git, workspace, iteration)?;
    let branch = match mode {
        RollbackMode::Hard => {
            git.reset_hard(workspace, &sha)?;
            None
        }
        RollbackMode::Branch(name) => {
            let branch = name.clone().unwrap_or_else(|| {
                format!(
                    "rollback/iteration-{iteration}-{}",
                    Utc::now().format("%Y%m%d%H%M%S")
                )
            });
            git.create_branch_at(workspace, &branch, &sha)?;
            Some(branch)
        }
    };

    info!(%sha, ?branch, "workspace rolled back");
    Ok(RollbackOutcome { sha, branch })
}

/// Roll back the workspace of a named session.
///
/// # Errors
///
/// Returns `AppError::SessionRunning` if the session is running and `force`
/// is false, plus any error from [`rollback_with_mode`].
pub fn rollback_session(
    sessions: &dyn SessionManager,
    git: &dyn GitClient,
    name: &str,
    iteration: u32,
    mode: &RollbackMode,
    force: bool,
) -> Result<RollbackOutcome> {
    let session = sessions.load_session(name)?;
    ensure_rollback_allowed(&session, force)?;
    rollback_with_mode(git, &session.workspace, iteration, mode)
}

fn ensure_rollback_allowed(session: &Session, force: bool) -> Result<()> {
    if session.status == SessionStatus::Running && !force {
        return Err(AppError::SessionRunning(format!(
            "session '{}' is running and may be writing to {}; stop it or force the rollback",
            session.name,
            session.workspace.display()
        )));
    }
    Ok(())
}

/// User interaction used by [`interactive_rollback`].
pub trait Prompter {
    /// Ask the user to pick one of `options`; `None` cancels.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if input cannot be read.
    fn select(&mut self, question: &str, options: &[String]) -> Result<Option<usize>>;

    /// Ask a yes/no question.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if input cannot be read.
    fn confirm(&mut self, question: &str) -> Result<bool>;
}

/// Interactive, non-destructive rollback.
///
/// When `session` is `None` the user picks one from the session list. The
/// workspace is only touched after the confirmation gate; declining returns
/// `Ok(None)`.
///
/// # Errors
///
/// Returns `AppError::NotFound` if there are no sessions to choose from,
/// `AppError::SessionRunning` for running sessions without `force`, and
/// any rollback error.
pub fn interactive_rollback(
    sessions: &dyn SessionManager,
    git: &dyn GitClient,
    prompter: &mut dyn Prompter,
    session: Option<&str>,
    iteration: u32,
    force: bool,
) -> Result<Option<RollbackOutcome>> {
    let chosen = if let Some(name) = session {
        sessions.load_session(name)?
    } else {
        let all = sessions.list_sessions()?;
        if all.is_empty() {
            return Err(AppError::NotFound("no sessions to roll back".into()));
        }
        let labels: Vec<String> = all
            .iter()
            .map(|s| {
                format!(
                    "{} [{}] {}",
                    s.name,
                    s.display_status(),
                    s.workspace.display()
                )
            })
            .collect();
        let Some(index) = prompter.select("Which session should be rolled back?", &labels)?
        else {
            return Ok(None);
        };
        all.into_iter()
            .nth(index)
            .ok_or_else(|| AppError::NotFound(format!("no session at position {index}")))?
    };

    ensure_rollback_allowed(&chosen, force)?;
    let sha = find_checkpoint(git, &chosen.workspace, iteration)?;

    let question = format!(
        "Check out iteration {iteration} ({}) of '{}' on a new branch?",
        short_sha(&sha),
        chosen.name
    );
    if !prompter.confirm(&question)? {
        info!(session = %chosen.name, "rollback declined");
        return Ok(None);
    }

    rollback_with_mode(git, &chosen.workspace, iteration, &RollbackMode::Branch(None)).map(Some)
}

fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

/// Output of one bisect probe command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutput {
    /// Exit code; `None` when killed by a signal.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
}

/// Decides whether the checked-out commit is good.
pub trait BisectJudge: Send {
    /// Return `true` when the probe output describes a good commit.
    fn judge<'a>(
        &'a mut self,
        probe: &'a ProbeOutput,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;
}

/// Good means the probe exited with status 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitCodeJudge;

impl BisectJudge for ExitCodeJudge {
    fn judge<'a>(
        &'a mut self,
        probe: &'a ProbeOutput,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move { Ok(probe.exit_code == Some(0)) })
    }
}

/// Asks an agent to rule on the probe output.
pub struct AgentJudge<A> {
    agent: A,
    criteria: String,
}

impl<A: Agent> AgentJudge<A> {
    /// Judge with `agent`, describing what a good result looks like.
    #[must_use]
    pub fn new(agent: A, criteria: impl Into<String>) -> Self {
        Self {
            agent,
            criteria: criteria.into(),
        }
    }
}

impl<A: Agent> BisectJudge for AgentJudge<A> {
    fn judge<'a>(
        &'a mut self,
        probe: &'a ProbeOutput,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            let prompt = format!(
                "You are judging one step of a git bisect.\n\
                 A good commit satisfies: {}\n\
                 The probe exited with {:?} and printed:\n{}\n\n\
                 Reply with exactly GOOD or BAD.",
                self.criteria, probe.exit_code, probe.output
            );
            let reply = self.agent.send(&prompt).await?;
            let verdict = reply.trim().to_ascii_uppercase();
            if verdict.contains("BAD") {
                Ok(false)
            } else if verdict.contains("GOOD") {
                Ok(true)
            } else {
                Err(AppError::Agent(format!("unclear bisect verdict: {reply}")))
            }
        })
    }
}

/// Options for [`bisect`].
#[derive(Debug, Clone)]
pub struct BisectRequest {
    /// Repository to bisect.
    pub workspace: PathBuf,
    /// Known good revision.
    pub good: String,
    /// Known bad revision.
    pub bad: String,
    /// Shell command run at every step.
    pub probe: String,
    /// Leave the repository in bisect state afterwards.
    pub keep_state: bool,
}

/// Find the first bad commit between `good` and `bad`.
///
/// # Errors
///
/// Returns `AppError::WorkspaceDirty` if the tree has uncommitted changes,
/// `AppError::Git` if bisect fails or does not converge.
pub async fn bisect(
    git: &dyn GitClient,
    request: &BisectRequest,
    judge: &mut dyn BisectJudge,
) -> Result<String> {
    let workspace = request.workspace.as_path();
    let span = info_span!(
        "bisect",
        workspace = %workspace.display(),
        good = %request.good,
        bad = %request.bad
    );

    if !git.status_porcelain(workspace)?.is_empty() {
        return Err(AppError::WorkspaceDirty(format!(
            "{} has uncommitted changes; bisect needs a clean tree",
            workspace.display()
        )));
    }

    git.bisect(workspace, &["start"])?;
    let result = drive_bisect(git, request, judge).instrument(span).await;

    if !request.keep_state {
        if let Err(err) = git.bisect(workspace, &["reset"]) {
            warn!(%err, "git bisect reset failed");
        }
    }
    result
}

async fn drive_bisect(
    git: &dyn GitClient,
    request: &BisectRequest,
    judge: &mut dyn BisectJudge,
) -> Result<String> {
    let workspace = request.workspace.as_path();
    git.bisect(workspace, &["bad", request.bad.as_str()])?;
    let mut output = git.bisect(workspace, &["good", request.good.as_str()])?;

    for step in 0..MAX_BISECT_STEPS {
        if let Some(sha) = first_bad_commit(&output) {
            info!(%sha, steps = step, "bisect converged");
            return Ok(sha);
        }
        let probe = run_probe(workspace, &request.probe).await?;
        let good = judge.judge(&probe).await?;
        debug!(step, good, "bisect step");
        output = git.bisect(workspace, &[if good { "good" } else { "bad" }])?;
    }

    Err(AppError::Git(format!(
        "bisect did not converge within {MAX_BISECT_STEPS} steps"
    )))
}

fn first_bad_commit(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.strip_suffix(" is the first bad commit")
            .map(|sha| sha.trim().to_owned())
    })
}

async fn run_probe(workspace: &Path, probe: &str) -> Result<ProbeOutput> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(probe)
        .current_dir(workspace)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|err| AppError::Process(format!("cannot run bisect probe: {err}")))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(ProbeOutput {
        exit_code: output.status.code(),
        output: text,
    })
}
