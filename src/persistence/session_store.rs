//! File-per-session JSON store.
//!
//! Each session lives in `<root>/<name>.json` next to its `<name>.log` and
//! `<name>.exit` companions. Archived sessions move, with their companions,
//! into `<root>/archived/`. Records are written whole through a temp file
//! and an atomic rename, so concurrent readers never see a partial record.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::models::session::Session;
use crate::persistence::write_atomic;
use crate::{AppError, Result};

const ARCHIVE_DIR: &str = "archived";
const RECORD_EXT: &str = "json";
const LOG_EXT: &str = "log";
const EXIT_EXT: &str = "exit";
const STASH_EXT: &str = "prev";

/// Reject names that are empty or would resolve outside the sessions directory.
///
/// # Errors
///
/// Returns `AppError::InvalidName` describing the problem.
pub fn validate_session_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(AppError::InvalidName("name must not be empty".into()));
    }
    if name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(AppError::InvalidName(format!(
            "'{name}' must not contain path separators"
        )));
    }
    let leaf = Path::new(name).file_name().and_then(|leaf| leaf.to_str());
    if leaf != Some(name) {
        return Err(AppError::InvalidName(format!("'{name}' is not a plain name")));
    }
    Ok(())
}

/// Namespace a record is read from or written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Namespace {
    Active,
    Archived,
}

/// Durable session storage rooted at a sessions directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
    archive: PathBuf,
}

impl SessionStore {
    /// Open (and create if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let archive = root.join(ARCHIVE_DIR);
        create_private_dir(&archive)?;
        Ok(Self { root, archive })
    }

    /// Sessions directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Log file for an active session.
    #[must_use]
    pub fn log_path(&self, name: &str) -> PathBuf {
        companion(&self.root, name, LOG_EXT)
    }

    /// Exit-status file written by the session wrapper.
    #[must_use]
    pub fn exit_path(&self, name: &str) -> PathBuf {
        companion(&self.root, name, EXIT_EXT)
    }

    /// Whether an active record exists under `name`.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.record_path(name, Namespace::Active).exists()
    }

    /// Whether an archived record exists under `name`.
    #[must_use]
    pub fn archived_exists(&self, name: &str) -> bool {
        self.record_path(name, Namespace::Archived).exists()
    }

    /// Read an active session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` for unknown names and
    /// `AppError::Store` for unreadable or corrupt records.
    pub fn load(&self, name: &str) -> Result<Session> {
        validate_session_name(name)?;
        read_record(&self.record_path(name, Namespace::Active), name)
    }

    /// Read an archived session record.
    ///
    /// # Errors
    ///
    /// Same as [`SessionStore::load`].
    pub fn load_archived(&self, name: &str) -> Result<Session> {
        validate_session_name(name)?;
        read_record(&self.record_path(name, Namespace::Archived), name)
    }

    /// Persist an active session record, replacing any previous version.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if serialization or the atomic write fails.
    pub fn save(&self, session: &Session) -> Result<()> {
        validate_session_name(&session.name)?;
        self.write_record(session, Namespace::Active)
    }

    /// List active sessions, skipping records that fail to parse.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the directory itself cannot be read.
    pub fn list(&self) -> Result<Vec<Session>> {
        list_dir(&self.root)
    }

    /// List archived sessions, skipping records that fail to parse.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the directory itself cannot be read.
    pub fn list_archived(&self) -> Result<Vec<Session>> {
        list_dir(&self.archive)
    }

    /// Delete an active record and its companions. Missing files are ignored.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a file exists but cannot be removed.
    pub fn remove(&self, name: &str) -> Result<()> {
        validate_session_name(name)?;
        for path in [
            self.record_path(name, Namespace::Active),
            self.log_path(name),
            self.exit_path(name),
        ] {
            remove_if_exists(&path)?;
        }
        debug!(session = name, "removed session files");
        Ok(())
    }

    /// Clear the log and exit-status files left by a previous run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a file exists but cannot be removed.
    pub fn clear_companions(&self, name: &str) -> Result<()> {
        remove_if_exists(&self.log_path(name))?;
        remove_if_exists(&self.exit_path(name))
    }

    /// Move the previous run's log and exit files aside so a new run starts
    /// with fresh ones. The returned stash puts them back or drops them.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if a file cannot be moved.
    pub fn stash_companions(&self, name: &str) -> Result<CompanionStash> {
        let moves: Vec<(PathBuf, PathBuf)> = [LOG_EXT, EXIT_EXT]
            .into_iter()
            .map(|ext| {
                (
                    companion(&self.root, name, ext),
                    companion(&self.root, name, &format!("{ext}.{STASH_EXT}")),
                )
            })
            .collect();
        Ok(CompanionStash {
            moves: move_all(&moves)?,
        })
    }

    /// Move a session and its companions into the archive namespace.
    ///
    /// The record's `log_file` is rewritten to the archived location. On
    /// failure every move already made is undone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if an archived record with the same
    /// name exists, or `AppError::Store` if a move fails.
    pub fn archive(&self, session: &mut Session) -> Result<()> {
        if self.archived_exists(&session.name) {
            return Err(AppError::InvalidState(format!(
                "an archived session named '{}' already exists",
                session.name
            )));
        }
        self.relocate(session, Namespace::Active, Namespace::Archived)
    }

    /// Move an archived session and its companions back to the active namespace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if an active record with the same
    /// name exists, or `AppError::Store` if a move fails.
    pub fn unarchive(&self, session: &mut Session) -> Result<()> {
        if self.exists(&session.name) {
            return Err(AppError::InvalidState(format!(
                "an active session named '{}' already exists",
                session.name
            )));
        }
        self.relocate(session, Namespace::Archived, Namespace::Active)
    }

    /// Re-key an active session under `new_name`, moving its companions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if `new_name` is taken, or
    /// `AppError::Store` if a move fails.
    pub fn rename(&self, session: &mut Session, new_name: &str) -> Result<()> {
        validate_session_name(new_name)?;
        if self.exists(new_name) || self.archived_exists(new_name) {
            return Err(AppError::InvalidState(format!(
                "a session named '{new_name}' already exists"
            )));
        }

        let old_name = session.name.clone();
        let moves = [
            (self.log_path(&old_name), self.log_path(new_name)),
            (self.exit_path(&old_name), self.exit_path(new_name)),
        ];
        let done = move_all(&moves)?;

        session.name = new_name.to_owned();
        session.log_file = self.log_path(new_name);
        if let Err(err) = self.write_record(session, Namespace::Active) {
            undo_moves(&done);
            session.name = old_name;
            session.log_file = self.log_path(&session.name);
            return Err(err);
        }
        remove_if_exists(&self.record_path(&old_name, Namespace::Active))
    }

    fn relocate(&self, session: &mut Session, from: Namespace, to: Namespace) -> Result<()> {
        let name = session.name.clone();
        let moves = [
            (
                companion(self.dir(from), &name, LOG_EXT),
                companion(self.dir(to), &name, LOG_EXT),
            ),
            (
                companion(self.dir(from), &name, EXIT_EXT),
                companion(self.dir(to), &name, EXIT_EXT),
            ),
        ];
        let done = move_all(&moves)?;

        let previous_log = session.log_file.clone();
        session.log_file = companion(self.dir(to), &name, LOG_EXT);
        if let Err(err) = self.write_record(session, to) {
            undo_moves(&done);
            session.log_file = previous_log;
            return Err(err);
        }
        remove_if_exists(&self.record_path(&name, from))
    }

    fn dir(&self, namespace: Namespace) -> &Path {
        match namespace {
            Namespace::Active => &self.root,
            Namespace::Archived => &self.archive,
        }
    }

    fn record_path(&self, name: &str, namespace: Namespace) -> PathBuf {
        companion(self.dir(namespace), name, RECORD_EXT)
    }

    fn write_record(&self, session: &Session, namespace: Namespace) -> Result<()> {
        let target = self.record_path(&session.name, namespace);
        let body = serde_json::to_vec_pretty(session)?;
        write_atomic(&target, &body)
    }
}

/// Companion files of a replaced run, held aside while a new run launches.
#[derive(Debug)]
#[must_use]
pub struct CompanionStash {
    moves: Vec<(PathBuf, PathBuf)>,
}

impl CompanionStash {
    /// Put the stashed files back in place.
    pub fn restore(self) {
        undo_moves(&self.moves);
    }

    /// Delete the stashed files.
    pub fn discard(self) {
        for (_, stashed) in &self.moves {
            if let Err(err) = remove_if_exists(stashed) {
                warn!(%err, "cannot remove stashed session file");
            }
        }
    }
}

fn companion(dir: &Path, name: &str, ext: &str) -> PathBuf {
    dir.join(format!("{name}.{ext}"))
}

fn read_record(path: &Path, name: &str) -> Result<Session> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(AppError::SessionNotFound(name.to_owned()));
        }
        Err(err) => {
            return Err(AppError::Store(format!(
                "cannot read {}: {err}",
                path.display()
            )));
        }
    };
    let mut session: Session = serde_json::from_slice(&raw)
        .map_err(|err| AppError::Store(format!("corrupt record {}: {err}", path.display())))?;
    session.normalize();
    Ok(session)
}

fn list_dir(dir: &Path) -> Result<Vec<Session>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(AppError::Store(format!(
                "cannot read {}: {err}",
                dir.display()
            )))
        }
    };

    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXT) {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        match read_record(&path, name) {
            Ok(session) => sessions.push(session),
            Err(err) => warn!(path = %path.display(), %err, "skipping unreadable session record"),
        }
    }
    sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.name.cmp(&b.name)));
    Ok(sessions)
}

fn move_all(moves: &[(PathBuf, PathBuf)]) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut done = Vec::new();
    for (from, to) in moves {
        if !from.exists() {
            continue;
        }
        if let Err(err) = fs::rename(from, to) {
            undo_moves(&done);
            return Err(AppError::Store(format!(
                "cannot move {} to {}: {err}",
                from.display(),
                to.display()
            )));
        }
        done.push((from.clone(), to.clone()));
    }
    Ok(done)
}

fn undo_moves(done: &[(PathBuf, PathBuf)]) {
    for (from, to) in done.iter().rev() {
        if let Err(err) = fs::rename(to, from) {
            warn!(path = %to.display(), %err, "failed to roll back file move");
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(AppError::Store(format!(
            "cannot remove {}: {err}",
            path.display()
        ))),
    }
}

fn create_private_dir(path: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(path)
        .map_err(|err| AppError::Store(format!("cannot create {}: {err}", path.display())))
}
