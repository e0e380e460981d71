//! Session lifecycle management: start, stop, pause, resume, archive.
//!
//! [`LocalSessionManager`] is the single authority over session records. It
//! launches each command as a detached process group whose output goes to
//! the session log, and talks to it afterwards only through signals and the
//! files it leaves behind. A record claiming `running` for a dead process is
//! reconciled on the next load or listing.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn};

use crate::git::{GitClient, GitCli};
use crate::models::session::{Session, SessionStatus};
use crate::orchestrator::process::{self, SessionSignal};
use crate::persistence::session_store::{validate_session_name, SessionStore};
use crate::{AppError, Result};

/// Shell wrapper that records the command's exit status next to the log.
const EXIT_WRAPPER: &str =
    r#""$@"; status=$?; printf '%s' "$status" > "$RECAC_EXIT_FILE"; exit "$status""#;

/// Workspace files written by the agent itself; ignored by the dirty check.
const AGENT_OWNED_FILES: &[&str] = &[".agent_state.json"];

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Parameters for [`SessionManager::start_session`].
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Unique session name.
    pub name: String,
    /// First user-facing instruction, for display.
    pub goal: String,
    /// Program and arguments to launch.
    pub command: Vec<String>,
    /// Directory the agent operates in.
    pub workspace: PathBuf,
    /// Labels to attach to the record.
    pub tags: Vec<String>,
}

impl StartRequest {
    /// Build a request from the four required fields.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        goal: impl Into<String>,
        command: Vec<String>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            goal: goal.into(),
            command,
            workspace: workspace.into(),
            tags: Vec::new(),
        }
    }
}

/// Authority over session records and the OS processes behind them.
pub trait SessionManager: Send + Sync {
    /// Launch `request.command` detached and persist a `running` session.
    ///
    /// # Errors
    ///
    /// `DuplicateSession` if a live session holds the name, `WorkspaceDirty`
    /// if the workspace has uncommitted changes and dirty starts are off,
    /// `Process` if the launch fails (no record is left behind).
    fn start_session(&self, request: StartRequest) -> Result<Session>;

    /// Terminate the session's process and mark it `stopped`. No-op for
    /// sessions that are not running.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` for unknown names, `Store` on persistence failure.
    fn stop_session(&self, name: &str) -> Result<Session>;

    /// Suspend a running session.
    ///
    /// # Errors
    ///
    /// `NotRunning` if the session is not running.
    fn pause_session(&self, name: &str) -> Result<Session>;

    /// Continue a paused session.
    ///
    /// # Errors
    ///
    /// `NotRunning` if the session is not running, `InvalidState` if it is
    /// not paused.
    fn resume_session(&self, name: &str) -> Result<Session>;

    /// Liveness probe for `pid`.
    fn is_process_running(&self, pid: i32) -> bool;

    /// All active (non-archived) sessions, reconciled.
    ///
    /// # Errors
    ///
    /// `Store` if the sessions directory cannot be read.
    fn list_sessions(&self) -> Result<Vec<Session>>;

    /// One active session, reconciled.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` for unknown names.
    fn load_session(&self, name: &str) -> Result<Session>;

    /// Persist a record produced outside `start_session`, such as one for a
    /// container dispatched by the orchestrator.
    ///
    /// # Errors
    ///
    /// `InvalidName` or `Store`.
    fn track_session(&self, session: &Session) -> Result<()>;

    /// Move a finished session into the archive namespace.
    ///
    /// # Errors
    ///
    /// `SessionRunning` if the process is alive.
    fn archive_session(&self, name: &str) -> Result<Session>;

    /// Restore an archived session to its prior terminal state.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if no archived record exists, `InvalidState` if an
    /// active session already uses the name.
    fn unarchive_session(&self, name: &str) -> Result<Session>;

    /// All archived sessions.
    ///
    /// # Errors
    ///
    /// `Store` if the archive directory cannot be read.
    fn list_archived_sessions(&self) -> Result<Vec<Session>>;

    /// Re-key a session.
    ///
    /// # Errors
    ///
    /// `InvalidState` if `new` is taken, `SessionRunning` if the process is alive.
    fn rename_session(&self, old: &str, new: &str) -> Result<Session>;

    /// Delete a session and its log.
    ///
    /// # Errors
    ///
    /// `SessionRunning` if the process is alive and `force` is false.
    fn remove_session(&self, name: &str, force: bool) -> Result<()>;

    /// Path of the session log.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` for unknown names.
    fn session_logs(&self, name: &str) -> Result<PathBuf>;

    /// Last `lines` lines of the session log; `0` returns everything.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` for unknown names, `Io` if the log is unreadable.
    fn session_log_content(&self, name: &str, lines: usize) -> Result<String>;

    /// `git diff --stat` between the session's start and end commits.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` for unknown names, `Git` on diff failure.
    fn session_git_diff_stat(&self, name: &str) -> Result<String>;

    /// The agent's own state file, if it has written one.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` for unknown names, `Store` if the file is not JSON.
    fn agent_state(&self, name: &str) -> Result<Option<serde_json::Value>>;
}

/// Session manager backed by a [`SessionStore`] on the local filesystem.
pub struct LocalSessionManager {
    store: SessionStore,
    git: Arc<dyn GitClient>,
    allow_dirty: bool,
    stop_grace: Duration,
}

impl LocalSessionManager {
    /// Create a manager over `store` using the `git` binary.
    #[must_use]
    pub fn new(store: SessionStore) -> Self {
        Self::with_git(store, Arc::new(GitCli::default()))
    }

    /// Create a manager with an explicit git client.
    #[must_use]
    pub fn with_git(store: SessionStore, git: Arc<dyn GitClient>) -> Self {
        Self {
            store,
            git,
            allow_dirty: false,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Permit starting sessions in workspaces with uncommitted changes.
    #[must_use]
    pub fn allow_dirty(mut self, allow: bool) -> Self {
        self.allow_dirty = allow;
        self
    }

    /// How long `stop_session` waits after SIGTERM before SIGKILL.
    #[must_use]
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Git client used for commit bounds.
    #[must_use]
    pub fn git(&self) -> Arc<dyn GitClient> {
        Arc::clone(&self.git)
    }

    /// Whether `name` holds a finished record the new start will replace.
    fn check_name_free(&self, name: &str) -> Result<bool> {
        if !self.store.exists(name) {
            return Ok(false);
        }
        let existing = self.load_session(name)?;
        if existing.status == SessionStatus::Running {
            return Err(AppError::DuplicateSession(name.to_owned()));
        }
        Ok(true)
    }

    fn capture_start_commit(&self, workspace: &Path) -> Result<String> {
        if !self.git.is_repository(workspace) {
            debug!(workspace = %workspace.display(), "workspace is not a git repository");
            return Ok(String::new());
        }

        if !self.allow_dirty {
            let dirty: Vec<String> = self
                .git
                .status_porcelain(workspace)?
                .into_iter()
                .filter(|line| !is_agent_owned(line))
                .collect();
            if !dirty.is_empty() {
                return Err(AppError::WorkspaceDirty(format!(
                    "{} has {} uncommitted change(s); commit them or allow dirty starts",
                    workspace.display(),
                    dirty.len()
                )));
            }
        }

        match self.git.head_sha(workspace) {
            Ok(sha) => Ok(sha),
            Err(err) => {
                warn!(%err, "cannot resolve workspace HEAD; start commit left empty");
                Ok(String::new())
            }
        }
    }

    fn launch(&self, name: &str, command: &[String], workspace: &Path) -> Result<(i32, PathBuf)> {
        let log_path = self.store.log_path(name);
        let log = open_log(&log_path)?;
        let stderr = log
            .try_clone()
            .map_err(|err| AppError::Io(format!("cannot share log handle: {err}")))?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(EXIT_WRAPPER)
            .arg("recac-session")
            .args(command)
            .current_dir(workspace)
            .env("RECAC_EXIT_FILE", self.store.exit_path(name))
            .env("RECAC_SESSION_NAME", name)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        match cmd.spawn() {
            Ok(child) => {
                let pid = i32::try_from(child.id())
                    .map_err(|err| AppError::Process(format!("pid out of range: {err}")))?;
                Ok((pid, log_path))
            }
            Err(err) => {
                let _ = fs::remove_file(&log_path);
                Err(AppError::Process(format!(
                    "cannot launch {}: {err}",
                    command.first().map_or("", String::as_str)
                )))
            }
        }
    }

    /// Correct a record whose process died without updating it, and fill
    /// in a missing end commit. Returns whether anything changed.
    fn reconcile(&self, session: &mut Session) -> bool {
        let mut changed = false;

        if session.status == SessionStatus::Running
            && session.has_local_process()
            && !process::is_process_running(session.pid)
        {
            let exit_path = self.store.exit_path(&session.name);
            match read_exit_status(&exit_path) {
                Some(0) => session.status = SessionStatus::Completed,
                Some(code) => {
                    session.status = SessionStatus::Error;
                    session.error = format!("process exited with status {code}");
                }
                None => {
                    session.status = SessionStatus::Error;
                    session.error =
                        format!("process {} exited without recording a status", session.pid);
                }
            }
            session.paused = false;
            session.end_time = Some(modified_at(&exit_path).unwrap_or_else(Utc::now));
            info!(session = %session.name, status = %session.status, "reconciled dead session");
            changed = true;
        }

        if matches!(
            session.status,
            SessionStatus::Completed | SessionStatus::Stopped
        ) && session.end_commit_sha.is_empty()
        {
            if let Some(sha) = self.resolve_head(&session.workspace) {
                session.end_commit_sha = sha;
                changed = true;
            }
        }

        changed
    }

    fn resolve_head(&self, workspace: &Path) -> Option<String> {
        if workspace.as_os_str().is_empty() || !workspace.is_dir() {
            return None;
        }
        if !self.git.is_repository(workspace) {
            return None;
        }
        self.git.head_sha(workspace).ok()
    }

    fn wait_for_exit(&self, pid: i32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !process::is_process_running(pid) {
                return true;
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
        }
        !process::is_process_running(pid)
    }

    fn require_running(session: &Session) -> Result<()> {
        if session.status == SessionStatus::Running {
            Ok(())
        } else {
            Err(AppError::NotRunning(format!(
                "session '{}' is {}",
                session.name, session.status
            )))
        }
    }
}

impl SessionManager for LocalSessionManager {
    fn start_session(&self, request: StartRequest) -> Result<Session> {
        let span = info_span!("start_session", session = %request.name);
        let _guard = span.enter();

        validate_session_name(&request.name)?;
        if request.command.is_empty() {
            return Err(AppError::InvalidState("command must not be empty".into()));
        }
        let workspace = request.workspace.canonicalize().map_err(|err| {
            AppError::Io(format!(
                "workspace {} is not accessible: {err}",
                request.workspace.display()
            ))
        })?;

        let replacing = self.check_name_free(&request.name)?;
        let start_commit_sha = self.capture_start_commit(&workspace)?;
        let stash = self.store.stash_companions(&request.name)?;

        let (pid, log_path) = match self.launch(&request.name, &request.command, &workspace) {
            Ok(launched) => launched,
            Err(err) => {
                stash.restore();
                return Err(err);
            }
        };

        let mut session = Session::new(&request.name, &request.goal, workspace, log_path);
        session.pid = pid;
        session.status = SessionStatus::Running;
        session.command = request.command;
        session.start_commit_sha = start_commit_sha;
        session.tags = request.tags.into_iter().collect();

        if let Err(err) = self.store.save(&session) {
            warn!(pid, %err, "cannot persist session; killing process");
            let _ = process::signal_group(pid, SessionSignal::Kill);
            let _ = self.store.clear_companions(&session.name);
            stash.restore();
            return Err(err);
        }
        stash.discard();

        if replacing {
            info!(pid, "session started, replacing finished record");
        } else {
            info!(pid, "session started");
        }
        Ok(session)
    }

    fn stop_session(&self, name: &str) -> Result<Session> {
        let span = info_span!("stop_session", session = name);
        let _guard = span.enter();

        let mut session = self.load_session(name)?;
        if session.status != SessionStatus::Running {
            debug!(status = %session.status, "session already finished");
            return Ok(session);
        }

        if session.has_local_process() && process::is_process_running(session.pid) {
            process::signal_group(session.pid, SessionSignal::Terminate)?;
            if session.paused {
                process::signal_group(session.pid, SessionSignal::Resume)?;
            }
            if !self.wait_for_exit(session.pid, self.stop_grace) {
                warn!(pid = session.pid, "process ignored SIGTERM; killing");
                if let Err(err) = process::signal_group(session.pid, SessionSignal::Kill) {
                    warn!(%err, "SIGKILL failed");
                }
                self.wait_for_exit(session.pid, STOP_POLL_INTERVAL * 10);
            }
        } else if !session.has_local_process() {
            warn!("session has no local process; marking stopped only");
        }

        session.status = SessionStatus::Stopped;
        session.paused = false;
        session.end_time = Some(Utc::now());
        if let Some(sha) = self.resolve_head(&session.workspace) {
            session.end_commit_sha = sha;
        }
        self.store.save(&session)?;

        info!("session stopped");
        Ok(session)
    }

    fn pause_session(&self, name: &str) -> Result<Session> {
        let span = info_span!("pause_session", session = name);
        let _guard = span.enter();

        let mut session = self.load_session(name)?;
        Self::require_running(&session)?;
        if session.paused {
            return Ok(session);
        }
        if !session.has_local_process() {
            return Err(AppError::InvalidState(format!(
                "session '{name}' has no local process to pause"
            )));
        }

        process::signal_group(session.pid, SessionSignal::Pause)?;
        session.paused = true;
        self.store.save(&session)?;

        info!(pid = session.pid, "session paused");
        Ok(session)
    }

    fn resume_session(&self, name: &str) -> Result<Session> {
        let span = info_span!("resume_session", session = name);
        let _guard = span.enter();

        let mut session = self.load_session(name)?;
        Self::require_running(&session)?;
        if !session.paused {
            return Err(AppError::InvalidState(format!(
                "session '{name}' is not paused"
            )));
        }

        process::signal_group(session.pid, SessionSignal::Resume)?;
        session.paused = false;
        self.store.save(&session)?;

        info!(pid = session.pid, "session resumed");
        Ok(session)
    }

    fn is_process_running(&self, pid: i32) -> bool {
        process::is_process_running(pid)
    }

    fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions = self.store.list()?;
        for session in &mut sessions {
            if self.reconcile(session) {
                if let Err(err) = self.store.save(session) {
                    warn!(session = %session.name, %err, "cannot persist reconciled session");
                }
            }
        }
        Ok(sessions)
    }

    fn load_session(&self, name: &str) -> Result<Session> {
        let mut session = self.store.load(name)?;
        if self.reconcile(&mut session) {
            self.store.save(&session)?;
        }
        Ok(session)
    }

    fn track_session(&self, session: &Session) -> Result<()> {
        self.store.save(session)
    }

    fn archive_session(&self, name: &str) -> Result<Session> {
        let span = info_span!("archive_session", session = name);
        let _guard = span.enter();

        let mut session = self.load_session(name)?;
        if session.status == SessionStatus::Running {
            return Err(AppError::SessionRunning(format!(
                "stop session '{name}' before archiving it"
            )));
        }
        if !session.can_transition_to(SessionStatus::Archived) {
            return Err(AppError::InvalidState(format!(
                "session '{name}' is {} and cannot be archived",
                session.status
            )));
        }

        session.archived_from = Some(session.status);
        session.status = SessionStatus::Archived;
        self.store.archive(&mut session)?;

        info!("session archived");
        Ok(session)
    }

    fn unarchive_session(&self, name: &str) -> Result<Session> {
        let span = info_span!("unarchive_session", session = name);
        let _guard = span.enter();

        let mut session = self.store.load_archived(name)?;
        let restored = session.archived_from.unwrap_or(SessionStatus::Stopped);
        session.status = restored;
        session.archived_from = None;
        self.store.unarchive(&mut session)?;

        info!(status = %restored, "session unarchived");
        Ok(session)
    }

    fn list_archived_sessions(&self) -> Result<Vec<Session>> {
        self.store.list_archived()
    }

    fn rename_session(&self, old: &str, new: &str) -> Result<Session> {
        let span = info_span!("rename_session", session = old, new_name = new);
        let _guard = span.enter();

        let mut session = self.load_session(old)?;
        if session.status == SessionStatus::Running {
            return Err(AppError::SessionRunning(format!(
                "stop session '{old}' before renaming it"
            )));
        }
        self.store.rename(&mut session, new)?;

        info!("session renamed");
        Ok(session)
    }

    fn remove_session(&self, name: &str, force: bool) -> Result<()> {
        let span = info_span!("remove_session", session = name, force);
        let _guard = span.enter();

        let session = self.load_session(name)?;
        if session.status == SessionStatus::Running {
            if !force {
                return Err(AppError::SessionRunning(format!(
                    "session '{name}' is running; stop it first or force removal"
                )));
            }
            self.stop_session(name)?;
        }
        self.store.remove(name)?;

        info!("session removed");
        Ok(())
    }

    fn session_logs(&self, name: &str) -> Result<PathBuf> {
        Ok(self.load_session(name)?.log_file)
    }

    fn session_log_content(&self, name: &str, lines: usize) -> Result<String> {
        let path = self.session_logs(name)?;
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(String::new()),
            Err(err) => {
                return Err(AppError::Io(format!(
                    "cannot read log {}: {err}",
                    path.display()
                )))
            }
        };
        Ok(tail_lines(&String::from_utf8_lossy(&raw), lines))
    }

    fn session_git_diff_stat(&self, name: &str) -> Result<String> {
        let session = self.load_session(name)?;
        if session.start_commit_sha.is_empty() {
            return Ok(String::new());
        }
        let end = if session.end_commit_sha.is_empty() {
            "HEAD"
        } else {
            session.end_commit_sha.as_str()
        };
        self.git
            .diff_stat(&session.workspace, &session.start_commit_sha, end)
    }

    fn agent_state(&self, name: &str) -> Result<Option<serde_json::Value>> {
        let session = self.load_session(name)?;
        match fs::read(&session.agent_state_file) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AppError::Io(format!(
                "cannot read agent state {}: {err}",
                session.agent_state_file.display()
            ))),
        }
    }
}

/// Keep the last `count` lines of `text`; `0` keeps everything.
#[must_use]
pub fn tail_lines(text: &str, count: usize) -> String {
    if count == 0 {
        return text.to_owned();
    }
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    let mut out = lines[start..].join("\n");
    if !out.is_empty() && text.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn is_agent_owned(porcelain_line: &str) -> bool {
    porcelain_line
        .split_whitespace()
        .last()
        .is_some_and(|path| AGENT_OWNED_FILES.contains(&path))
}

fn open_log(path: &Path) -> Result<fs::File> {
    let mut options = OpenOptions::new();
    options.create_new(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(path)
        .map_err(|err| AppError::Io(format!("cannot create log {}: {err}", path.display())))
}

fn read_exit_status(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path).ok()?.modified().ok().map(DateTime::from)
}
