//! Local container spawner driven through the docker CLI.
//!
//! Each execution gets a fresh host workspace bind-mounted at `/workspace`
//! and a container labelled with the work item, so a restarted orchestrator
//! can find executions it launched earlier, including ones that exited
//! while it was down. Finalizing removes both the container and the
//! workspace. When a session manager is attached, every container is also
//! recorded as an `orchestrated-docker` session so it shows up next to local
//! sessions.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{AgentConfig, DockerConfig, PullPolicy};
use crate::models::session::{Session, SessionStatus, SESSION_TYPE_ORCHESTRATED_DOCKER};
use crate::models::work_item::WorkItem;
use crate::orchestrator::branching::{BranchPlan, WORKSPACE_MOUNT};
use crate::orchestrator::session_manager::SessionManager;
use crate::orchestrator::spawner::{
    execution_env, sanitize_label, ExecutionHandle, ExecutionOutcome, SpawnFuture, Spawner,
    FAILURE_OUTPUT_LINES, SECRET_PASSTHROUGH, WORK_ITEM_LABEL,
};
use crate::{AppError, Result};

/// Label marking containers owned by the orchestrator.
pub const MANAGED_LABEL: &str = "recac.io/managed=true";

/// Label holding the unsanitized work item ID.
pub const WORK_ITEM_ID_LABEL: &str = "recac.io/work-item-id";

/// Label holding the host workspace path.
pub const WORKSPACE_LABEL: &str = "recac.io/workspace";

/// `docker ps` row: container, raw item ID, sanitized item label, workspace.
const PS_FORMAT: &str = "{{.ID}}\t{{.Label \"recac.io/work-item-id\"}}\t{{.Label \"recac.io/work-item\"}}\t{{.Label \"recac.io/workspace\"}}";

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Spawner running one container per work item.
pub struct DockerSpawner {
    config: DockerConfig,
    sessions: Option<Arc<dyn SessionManager>>,
}

impl DockerSpawner {
    /// Spawner using the given container settings.
    #[must_use]
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            sessions: None,
        }
    }

    /// Record each container as a session through `sessions`.
    #[must_use]
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    async fn docker(&self, args: &[String]) -> Result<String> {
        debug!(binary = %self.config.binary, command = ?args.first(), "running docker");
        let output = Command::new(&self.config.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                AppError::Unavailable(format!("cannot run {}: {err}", self.config.binary))
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        let msg = format!(
            "{} {} failed: {stderr}",
            self.config.binary,
            args.first().map_or("", String::as_str)
        );
        if stderr.contains("Cannot connect to the Docker daemon") {
            Err(AppError::Unavailable(msg))
        } else {
            Err(AppError::Spawn(msg))
        }
    }

    async fn ensure_image(&self) -> Result<()> {
        let image = self.config.image.clone();
        match self.config.pull_policy {
            PullPolicy::Never => Ok(()),
            PullPolicy::Always => self.pull(&image).await,
            PullPolicy::IfNotPresent => {
                let inspect = ["image", "inspect", image.as_str()].map(str::to_owned);
                if self.docker(&inspect).await.is_ok() {
                    return Ok(());
                }
                self.pull(&image).await
            }
        }
    }

    async fn pull(&self, image: &str) -> Result<()> {
        info!(image, "pulling agent image");
        self.docker(&["pull".to_owned(), image.to_owned()]).await?;
        Ok(())
    }

    fn prepare_workspace(&self, item: &WorkItem) -> Result<PathBuf> {
        let dir = self.config.workspaces_dir.join(format!(
            "{}-{}",
            sanitize_label(&item.id),
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        std::fs::create_dir_all(&dir).map_err(|err| {
            AppError::Io(format!("cannot create workspace {}: {err}", dir.display()))
        })?;
        Ok(dir)
    }

    fn record_session(&self, item: &WorkItem, handle: &ExecutionHandle, command: Vec<String>) {
        let Some(sessions) = &self.sessions else {
            return;
        };
        let name = session_name(&item.id);
        match sessions.load_session(&name) {
            Ok(existing)
                if existing.session_type != SESSION_TYPE_ORCHESTRATED_DOCKER
                    || existing.status == SessionStatus::Running =>
            {
                warn!(
                    session = %name,
                    session_type = %existing.session_type,
                    status = %existing.status,
                    "session name in use; container not recorded"
                );
                return;
            }
            Ok(_) | Err(AppError::SessionNotFound(_)) => {}
            Err(err) => {
                warn!(%err, session = %name, "cannot check session name; container not recorded");
                return;
            }
        }

        let workspace = handle.workspace.clone().unwrap_or_default();
        let mut session = Session::new(&name, &item.title, workspace, PathBuf::new());
        session.session_type = SESSION_TYPE_ORCHESTRATED_DOCKER.to_owned();
        session.status = SessionStatus::Running;
        session.start_time = handle.started_at;
        session.command = command;
        session.tags.insert(format!("container:{}", handle.id));

        if let Err(err) = sessions.track_session(&session) {
            warn!(%err, session = %session.name, "cannot record orchestrated session");
        }
    }

    fn finish_session(&self, handle: &ExecutionHandle, outcome: &ExecutionOutcome) {
        let Some(sessions) = &self.sessions else {
            return;
        };
        let name = session_name(&handle.item_id);
        let mut session = match sessions.load_session(&name) {
            Ok(session) => session,
            Err(err) => {
                debug!(%err, session = %name, "no orchestrated session to finish");
                return;
            }
        };
        if session.status != SessionStatus::Running || !tracks_container(&session, &handle.id) {
            return;
        }
        match outcome {
            ExecutionOutcome::Succeeded => session.status = SessionStatus::Completed,
            ExecutionOutcome::Failed { reason, .. } => {
                session.status = SessionStatus::Error;
                session.error.clone_from(reason);
            }
            ExecutionOutcome::Unknown => {
                session.status = SessionStatus::Error;
                session.error = "container exit status unavailable".into();
            }
        }
        session.end_time = Some(Utc::now());
        if let Err(err) = sessions.track_session(&session) {
            warn!(%err, session = %name, "cannot update orchestrated session");
        }
    }

    fn remove_workspace(&self, workspace: &Path) {
        if !workspace.starts_with(&self.config.workspaces_dir) {
            warn!(path = %workspace.display(), "workspace outside workspaces_dir; leaving it");
            return;
        }
        match std::fs::remove_dir_all(workspace) {
            Ok(()) => debug!(path = %workspace.display(), "workspace removed"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(%err, path = %workspace.display(), "cannot remove workspace"),
        }
    }

    async fn launch(&self, item: &WorkItem, agent: &AgentConfig) -> Result<ExecutionHandle> {
        self.ensure_image().await?;
        let workspace = self.prepare_workspace(item)?;

        let env = execution_env(item, agent);
        let secrets: Vec<&str> = SECRET_PASSTHROUGH
            .iter()
            .copied()
            .filter(|key| std::env::var_os(key).is_some())
            .collect();
        let command = BranchPlan::for_item(item).wrap_command(&agent.command);
        let args = run_args(&self.config, item, &workspace, &env, &secrets, &command);

        let id = match self.docker(&args).await {
            Ok(id) => id,
            Err(err) => {
                let _ = std::fs::remove_dir_all(&workspace);
                return Err(err);
            }
        };

        let handle = ExecutionHandle {
            item_id: item.id.clone(),
            id,
            started_at: Utc::now(),
            workspace: Some(workspace),
        };
        self.record_session(item, &handle, command);
        info!(container = %handle.id, "container started");
        Ok(handle)
    }

    async fn running(&self, container: &str) -> Result<bool> {
        let args = ["inspect", "-f", "{{.State.Running}}", container].map(str::to_owned);
        match self.docker(&args).await {
            Ok(state) => Ok(state == "true"),
            Err(AppError::Spawn(msg)) if msg.contains("No such") => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Containers matching `filters`, one handle per `docker ps` row.
    async fn containers(&self, all: bool, filters: &[String]) -> Result<Vec<ExecutionHandle>> {
        let mut args = vec!["ps".to_owned()];
        if all {
            args.push("-a".to_owned());
        }
        for filter in filters {
            args.push("--filter".to_owned());
            args.push(filter.clone());
        }
        args.push("--format".to_owned());
        args.push(PS_FORMAT.to_owned());

        let out = self.docker(&args).await?;
        Ok(out.lines().filter_map(parse_ps_row).collect())
    }

    async fn lookup(&self, item_id: &str) -> Result<Option<ExecutionHandle>> {
        let filter = format!("label={WORK_ITEM_LABEL}={}", sanitize_label(item_id));
        let found = self.containers(false, &[filter]).await?;
        for mut handle in found {
            if handle.item_id != item_id && handle.item_id != sanitize_label(item_id) {
                debug!(container = %handle.id, other = %handle.item_id, "label collision; not adopting");
                continue;
            }
            handle.item_id = item_id.to_owned();
            return Ok(Some(handle));
        }
        Ok(None)
    }

    async fn exited(&self) -> Result<Vec<ExecutionHandle>> {
        let filters = [format!("label={MANAGED_LABEL}"), "status=exited".to_owned()];
        self.containers(true, &filters).await
    }

    async fn tail_logs(&self, container: &str) -> String {
        let tail = FAILURE_OUTPUT_LINES.to_string();
        let args = ["logs", "--tail", tail.as_str(), container].map(str::to_owned);
        match self.docker(&args).await {
            Ok(output) => output,
            Err(err) => {
                warn!(%err, container, "cannot collect container output");
                String::new()
            }
        }
    }

    async fn cleanup(&self, handle: &ExecutionHandle) -> Result<ExecutionOutcome> {
        let inspect = ["inspect", "-f", "{{.State.ExitCode}}", handle.id.as_str()].map(str::to_owned);
        let exit_code = match self.docker(&inspect).await {
            Ok(raw) => raw.parse::<i32>().ok(),
            Err(err) => {
                warn!(%err, container = %handle.id, "cannot read container exit code");
                None
            }
        };
        let outcome = match exit_code {
            Some(0) => ExecutionOutcome::Succeeded,
            Some(code) => ExecutionOutcome::Failed {
                reason: format!("container exited with status {code}"),
                output: self.tail_logs(&handle.id).await,
            },
            None => ExecutionOutcome::Unknown,
        };
        self.finish_session(handle, &outcome);

        match self.docker(&["rm".to_owned(), handle.id.clone()]).await {
            Ok(_) => {}
            Err(AppError::Spawn(msg)) if msg.contains("No such") => {}
            Err(err) => return Err(err),
        }
        if let Some(workspace) = &handle.workspace {
            self.remove_workspace(workspace);
        }
        info!(container = %handle.id, ?exit_code, "container finalized");
        Ok(outcome)
    }
}

impl Spawner for DockerSpawner {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn spawn<'a>(
        &'a self,
        item: &'a WorkItem,
        agent: &'a AgentConfig,
    ) -> SpawnFuture<'a, ExecutionHandle> {
        let span = info_span!("docker_spawn", item_id = %item.id);
        Box::pin(self.launch(item, agent).instrument(span))
    }

    fn is_active<'a>(&'a self, handle: &'a ExecutionHandle) -> SpawnFuture<'a, bool> {
        Box::pin(self.running(&handle.id))
    }

    fn find_active<'a>(&'a self, item_id: &'a str) -> SpawnFuture<'a, Option<ExecutionHandle>> {
        Box::pin(self.lookup(item_id))
    }

    fn finalize<'a>(&'a self, handle: &'a ExecutionHandle) -> SpawnFuture<'a, ExecutionOutcome> {
        let span = info_span!("docker_finalize", item_id = %handle.item_id);
        Box::pin(self.cleanup(handle).instrument(span))
    }

    fn logs<'a>(&'a self, handle: &'a ExecutionHandle) -> SpawnFuture<'a, String> {
        Box::pin(async move {
            match self.docker(&["logs".to_owned(), handle.id.clone()]).await {
                Err(AppError::Spawn(msg)) if msg.contains("No such") => Err(AppError::NotFound(
                    format!("container {} for {}", handle.id, handle.item_id),
                )),
                other => other,
            }
        })
    }

    fn finished(&self) -> SpawnFuture<'_, Vec<ExecutionHandle>> {
        Box::pin(self.exited())
    }
}

fn parse_ps_row(line: &str) -> Option<ExecutionHandle> {
    let mut columns = line.split('\t').map(str::trim);
    let id = columns.next().filter(|id| !id.is_empty())?;
    let raw_id = columns.next().unwrap_or_default();
    let label = columns.next().unwrap_or_default();
    let workspace = columns.next().unwrap_or_default();
    let item_id = if raw_id.is_empty() { label } else { raw_id };
    Some(ExecutionHandle {
        item_id: item_id.to_owned(),
        id: id.to_owned(),
        started_at: Utc::now(),
        workspace: (!workspace.is_empty()).then(|| PathBuf::from(workspace)),
    })
}

/// Whether `session` is the record of `container`. Short and full container
/// IDs are treated as the same container.
fn tracks_container(session: &Session, container: &str) -> bool {
    session.session_type == SESSION_TYPE_ORCHESTRATED_DOCKER
        && session
            .tags
            .iter()
            .filter_map(|tag| tag.strip_prefix("container:"))
            .any(|id| !id.is_empty() && (id.starts_with(container) || container.starts_with(id)))
}

/// Session name used for an item's container record.
#[must_use]
pub fn session_name(item_id: &str) -> String {
    format!("agent-{}", sanitize_label(item_id))
}

/// Arguments for `docker run`. Secrets are passed by name only so their
/// values are inherited from the CLI's environment rather than placed on
/// the command line.
#[must_use]
pub fn run_args(
    config: &DockerConfig,
    item: &WorkItem,
    workspace: &Path,
    env: &BTreeMap<String, String>,
    secrets: &[&str],
    command: &[String],
) -> Vec<String> {
    let label = sanitize_label(&item.id);
    let mut args = vec![
        "run".to_owned(),
        "-d".to_owned(),
        "--name".to_owned(),
        format!("recac-{label}-{}", Utc::now().timestamp()),
        "--label".to_owned(),
        format!("{WORK_ITEM_LABEL}={label}"),
        "--label".to_owned(),
        format!("{WORK_ITEM_ID_LABEL}={}", item.id),
        "--label".to_owned(),
        format!("{WORKSPACE_LABEL}={}", workspace.display()),
        "--label".to_owned(),
        MANAGED_LABEL.to_owned(),
        "-v".to_owned(),
        format!("{}:{WORKSPACE_MOUNT}", workspace.display()),
        "-w".to_owned(),
        WORKSPACE_MOUNT.to_owned(),
    ];
    if let Some(network) = &config.network {
        args.push("--network".to_owned());
        args.push(network.clone());
    }
    if config.mount_docker_socket {
        args.push("-v".to_owned());
        args.push(format!("{DOCKER_SOCKET}:{DOCKER_SOCKET}"));
    }
    for (key, value) in env {
        args.push("-e".to_owned());
        args.push(format!("{key}={value}"));
    }
    for key in secrets {
        args.push("-e".to_owned());
        args.push((*key).to_owned());
    }
    args.push(config.image.clone());
    args.extend(command.iter().cloned());
    args
}
