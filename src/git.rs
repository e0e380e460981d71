//! Git access for checkpoints, commit bounds, and rollback.
//!
//! [`GitClient`] is the seam used by the session manager and checkpoint
//! manager; [`GitCli`] implements it by shelling out to the `git` binary.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::{AppError, Result};

/// Identity used for checkpoint commits when the repository has none configured.
const FALLBACK_USER_NAME: &str = "RECAC Agent";
const FALLBACK_USER_EMAIL: &str = "agent@recac.io";

/// One commit as listed by [`GitClient::log`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    /// Full commit SHA.
    pub sha: String,
    /// First line of the commit message.
    pub subject: String,
}

/// Git operations required by the core.
pub trait GitClient: Send + Sync {
    /// Whether `workspace` is inside a git work tree.
    fn is_repository(&self, workspace: &Path) -> bool;

    /// Current `HEAD` commit SHA.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Git` if `HEAD` cannot be resolved.
    fn head_sha(&self, workspace: &Path) -> Result<String>;

    /// Current branch name, or `HEAD` when detached.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Git` on command failure.
    fn current_branch(&self, workspace: &Path) -> Result<String>;

    /// `git status --porcelain` lines.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Git` on command failure.
    fn status_porcelain(&self, workspace: &Path) -> Result<Vec<String>>;

    /// Stage everything (including untracked files) and commit, allowing an
    /// empty commit. Returns the new commit SHA.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Git` on command failure.
    fn commit_all(&self, workspace: &Path, message: &str) -> Result<String>;

    /// Commits reachable from `HEAD`, most recent first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Git` on command failure.
    fn log(&self, workspace: &Path) -> Result<Vec<CommitSummary>>;

    /// `git reset --hard <rev>`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Git` on command failure.
    fn reset_hard(&self, workspace: &Path, rev: &str) -> Result<()>;

    /// Create `branch` at `rev` and check it out.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Git` on command failure (e.g. branch exists).
    fn create_branch_at(&self, workspace: &Path, branch: &str, rev: &str) -> Result<()>;

    /// `git diff --stat <base> <head>`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Git` on command failure.
    fn diff_stat(&self, workspace: &Path, base: &str, head: &str) -> Result<String>;

    /// Run `git bisect <args>` and return its standard output.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Git` on command failure.
    fn bisect(&self, workspace: &Path, args: &[&str]) -> Result<String>;
}

/// [`GitClient`] backed by the `git` executable on `PATH`.
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCli {
    /// Use the given git executable.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, workspace: &Path, args: &[&str]) -> Result<String> {
        debug!(workspace = %workspace.display(), ?args, "git");
        let output = Command::new(&self.binary)
            .current_dir(workspace)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|err| AppError::Git(format!("cannot run git: {err}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Git(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    fn has_identity(&self, workspace: &Path) -> bool {
        self.run(workspace, &["config", "user.email"])
            .is_ok_and(|email| !email.is_empty())
    }
}

impl GitClient for GitCli {
    fn is_repository(&self, workspace: &Path) -> bool {
        self.run(workspace, &["rev-parse", "--is-inside-work-tree"])
            .is_ok_and(|out| out == "true")
    }

    fn head_sha(&self, workspace: &Path) -> Result<String> {
        self.run(workspace, &["rev-parse", "HEAD"])
    }

    fn current_branch(&self, workspace: &Path) -> Result<String> {
        self.run(workspace, &["rev-parse", "--abbrev-ref", "HEAD"])
    }

    fn status_porcelain(&self, workspace: &Path) -> Result<Vec<String>> {
        let out = self.run(workspace, &["status", "--porcelain"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    fn commit_all(&self, workspace: &Path, message: &str) -> Result<String> {
        self.run(workspace, &["add", "-A"])?;

        let name_flag = format!("user.name={FALLBACK_USER_NAME}");
        let email_flag = format!("user.email={FALLBACK_USER_EMAIL}");
        let mut args: Vec<&str> = Vec::new();
        if !self.has_identity(workspace) {
            args.extend(["-c", name_flag.as_str(), "-c", email_flag.as_str()]);
        }
        args.extend(["commit", "--allow-empty", "--no-verify", "-m", message]);
        self.run(workspace, &args)?;

        self.head_sha(workspace)
    }

    fn log(&self, workspace: &Path) -> Result<Vec<CommitSummary>> {
        let out = self.run(workspace, &["log", "--format=%H%x1f%s"])?;
        Ok(out
            .lines()
            .filter_map(|line| {
                let (sha, subject) = line.split_once('\u{1f}')?;
                Some(CommitSummary {
                    sha: sha.to_owned(),
                    subject: subject.to_owned(),
                })
            })
            .collect())
    }

    fn reset_hard(&self, workspace: &Path, rev: &str) -> Result<()> {
        self.run(workspace, &["reset", "--hard", rev]).map(drop)
    }

    fn create_branch_at(&self, workspace: &Path, branch: &str, rev: &str) -> Result<()> {
        self.run(workspace, &["checkout", "-b", branch, rev]).map(drop)
    }

    fn diff_stat(&self, workspace: &Path, base: &str, head: &str) -> Result<String> {
        self.run(workspace, &["diff", "--stat", base, head])
    }

    fn bisect(&self, workspace: &Path, args: &[&str]) -> Result<String> {
        let mut full = vec!["bisect"];
        full.extend_from_slice(args);
        self.run(workspace, &full)
    }
}
