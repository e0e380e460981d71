//! Cluster spawner: one Kubernetes Job per work item, over the REST API.
//!
//! Job names are derived from the item ID, so a second spawn for the same
//! item finds the first job instead of creating a twin. Distinct IDs can
//! sanitize to the same name; the raw ID annotation decides whether an
//! existing job belongs to the item. A job that already failed is deleted
//! and the spawn reported as a transient failure; the next tick creates a
//! fresh one.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{AgentConfig, KubernetesConfig, SERVICE_ACCOUNT_DIR};
use crate::models::work_item::WorkItem;
use crate::orchestrator::branching::{BranchPlan, WORKSPACE_MOUNT};
use crate::orchestrator::spawner::{
    execution_env, sanitize_label, ExecutionHandle, ExecutionOutcome, SpawnFuture, Spawner,
    FAILURE_OUTPUT_LINES, WORK_ITEM_LABEL,
};
use crate::orchestrator::session_manager::tail_lines;
use crate::{AppError, Result};

/// Annotation holding the unsanitized work item ID.
pub const WORK_ITEM_ID_ANNOTATION: &str = "recac.io/work-item-id";

const APP_LABEL: &str = "recac-agent";
const JOB_PREFIX: &str = "recac-agent-";
const MAX_NAME_LEN: usize = 63;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Spawner creating batch Jobs in one namespace.
pub struct KubernetesSpawner {
    client: reqwest::Client,
    api_server: String,
    token: Option<String>,
    namespace: String,
    config: KubernetesConfig,
}

impl KubernetesSpawner {
    /// Resolve the API server, credentials, and namespace. Empty settings
    /// fall back to the in-cluster service account.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no API server can be determined or the
    /// CA bundle is unreadable.
    pub fn from_config(config: &KubernetesConfig) -> Result<Self> {
        let api_server = if config.api_server.trim().is_empty() {
            in_cluster_server().ok_or_else(|| {
                AppError::Config(
                    "kubernetes.api_server is empty and KUBERNETES_SERVICE_HOST is not set".into(),
                )
            })?
        } else {
            config.api_server.trim_end_matches('/').to_owned()
        };

        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        let ca_path = config
            .ca_cert
            .clone()
            .or_else(|| Some(Path::new(SERVICE_ACCOUNT_DIR).join("ca.crt")).filter(|p| p.exists()));
        if let Some(ca_path) = ca_path {
            let pem = fs::read(&ca_path).map_err(|err| {
                AppError::Config(format!("cannot read CA bundle {}: {err}", ca_path.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|err| AppError::Config(format!("invalid CA bundle: {err}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|err| AppError::Config(format!("cannot build http client: {err}")))?;

        let token = read_trimmed(&config.token_file);
        if token.is_none() {
            debug!(path = %config.token_file.display(), "no service account token; requests are unauthenticated");
        }

        let namespace = if config.namespace.trim().is_empty() {
            read_trimmed(&PathBuf::from(SERVICE_ACCOUNT_DIR).join("namespace"))
                .unwrap_or_else(|| "default".to_owned())
        } else {
            config.namespace.clone()
        };

        Ok(Self {
            client,
            api_server,
            token,
            namespace,
            config: config.clone(),
        })
    }

    /// Namespace jobs are created in.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn jobs_path(&self) -> String {
        format!("/apis/batch/v1/namespaces/{}/jobs", self.namespace)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Option<reqwest::Response>> {
        let url = format!("{}{path}", self.api_server);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let resp = request.send().await.map_err(|err| {
            AppError::Unavailable(format!("kubernetes api unreachable: {err}"))
        })?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let msg = format!("{method} {path} returned {}: {}", status.as_u16(), text.trim());
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                AppError::Unavailable(msg)
            } else {
                AppError::Spawn(msg)
            });
        }
        Ok(Some(resp))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<Option<T>> {
        match self.send(Method::GET, path, None).await? {
            Some(resp) => resp
                .json()
                .await
                .map(Some)
                .map_err(|err| AppError::Spawn(format!("unexpected response from {path}: {err}"))),
            None => Ok(None),
        }
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        let path = format!("{}/{name}", self.jobs_path());
        let body = json!({ "propagationPolicy": "Background" });
        self.send(Method::DELETE, &path, Some(&body)).await?;
        Ok(())
    }

    async fn create(&self, item: &WorkItem, agent: &AgentConfig) -> Result<ExecutionHandle> {
        let name = job_name(&item.id);
        let path = format!("{}/{name}", self.jobs_path());

        if let Some(existing) = self.get_json::<Job>(&path).await? {
            if !existing.serves(&item.id) {
                return Err(AppError::InvalidState(format!(
                    "job {name} already runs work item {}; cannot start {}",
                    existing.metadata.item_id().unwrap_or_default(),
                    item.id
                )));
            }
            if existing.status.failed > 0 {
                info!(job = %name, "deleting failed job before retry");
                self.delete_job(&name).await?;
                return Err(AppError::Spawn(format!(
                    "cleaning up failed job {name}; will retry next cycle"
                )));
            }
            info!(job = %name, succeeded = existing.status.succeeded, "job already exists; adopting");
            return Ok(handle_for(&item.id, name));
        }

        let manifest = job_manifest(&self.config, item, agent);
        match self
            .send(Method::POST, &self.jobs_path(), Some(&manifest))
            .await
        {
            Ok(_) => {}
            Err(AppError::Spawn(msg)) if msg.contains(" 409:") => {
                let existing = self.get_json::<Job>(&path).await?;
                if existing.is_some_and(|job| !job.serves(&item.id)) {
                    return Err(AppError::InvalidState(format!(
                        "job {name} was created concurrently for another work item"
                    )));
                }
                warn!(job = %name, "job created concurrently; adopting");
            }
            Err(err) => return Err(err),
        }
        info!(job = %name, namespace = %self.namespace, "job created");
        Ok(handle_for(&item.id, name))
    }

    async fn job_active(&self, handle: &ExecutionHandle) -> Result<bool> {
        let path = format!("{}/{}", self.jobs_path(), handle.id);
        Ok(self
            .get_json::<Job>(&path)
            .await?
            .is_some_and(|job| job.status.is_running()))
    }

    async fn lookup(&self, item_id: &str) -> Result<Option<ExecutionHandle>> {
        let path = format!(
            "{}?labelSelector={WORK_ITEM_LABEL}%3D{}",
            self.jobs_path(),
            sanitize_label(item_id)
        );
        let list: JobList = self.get_json(&path).await?.unwrap_or_default();
        Ok(list
            .items
            .into_iter()
            .find(|job| job.status.is_running() && job.serves(item_id))
            .map(|job| handle_for(item_id, job.metadata.name)))
    }

    async fn release(&self, handle: &ExecutionHandle) -> Result<ExecutionOutcome> {
        let path = format!("{}/{}", self.jobs_path(), handle.id);
        let outcome = match self.get_json::<Job>(&path).await? {
            Some(job) if job.status.succeeded > 0 => ExecutionOutcome::Succeeded,
            Some(job) if job.status.failed > 0 => {
                let output = match self.job_logs(handle).await {
                    Ok(log) => tail_lines(&log, FAILURE_OUTPUT_LINES),
                    Err(err) => {
                        warn!(%err, "cannot collect job output");
                        String::new()
                    }
                };
                ExecutionOutcome::Failed {
                    reason: format!("job {} failed", handle.id),
                    output,
                }
            }
            _ => ExecutionOutcome::Unknown,
        };
        self.delete_job(&handle.id).await?;
        info!(?outcome, "job deleted");
        Ok(outcome)
    }

    async fn job_logs(&self, handle: &ExecutionHandle) -> Result<String> {
        let pods_path = format!(
            "/api/v1/namespaces/{}/pods?labelSelector=job-name%3D{}",
            self.namespace, handle.id
        );
        let pods: PodList = self.get_json(&pods_path).await?.unwrap_or_default();
        let Some(pod) = pods.items.into_iter().next() else {
            return Err(AppError::NotFound(format!("no pods for job {}", handle.id)));
        };

        let log_path = format!(
            "/api/v1/namespaces/{}/pods/{}/log",
            self.namespace, pod.metadata.name
        );
        match self.send(Method::GET, &log_path, None).await? {
            Some(resp) => resp
                .text()
                .await
                .map_err(|err| AppError::Spawn(format!("cannot read pod log: {err}"))),
            None => Err(AppError::NotFound(format!("pod {}", pod.metadata.name))),
        }
    }
}

impl Spawner for KubernetesSpawner {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn spawn<'a>(
        &'a self,
        item: &'a WorkItem,
        agent: &'a AgentConfig,
    ) -> SpawnFuture<'a, ExecutionHandle> {
        let span = info_span!("k8s_spawn", item_id = %item.id);
        Box::pin(self.create(item, agent).instrument(span))
    }

    fn is_active<'a>(&'a self, handle: &'a ExecutionHandle) -> SpawnFuture<'a, bool> {
        Box::pin(self.job_active(handle))
    }

    fn find_active<'a>(&'a self, item_id: &'a str) -> SpawnFuture<'a, Option<ExecutionHandle>> {
        Box::pin(self.lookup(item_id))
    }

    fn finalize<'a>(&'a self, handle: &'a ExecutionHandle) -> SpawnFuture<'a, ExecutionOutcome> {
        let span = info_span!("k8s_finalize", job = %handle.id);
        Box::pin(self.release(handle).instrument(span))
    }

    fn logs<'a>(&'a self, handle: &'a ExecutionHandle) -> SpawnFuture<'a, String> {
        Box::pin(self.job_logs(handle))
    }
}

/// Deterministic job name for an item, at most 63 characters.
#[must_use]
pub fn job_name(item_id: &str) -> String {
    let mut name = format!("{JOB_PREFIX}{}", sanitize_label(item_id));
    name.truncate(MAX_NAME_LEN);
    name.trim_end_matches('-').to_owned()
}

/// Job manifest for `item`: a single non-restarting pod with an ephemeral
/// workspace, agent settings in the environment, and secrets from
/// `config.secret_name`.
#[must_use]
pub fn job_manifest(config: &KubernetesConfig, item: &WorkItem, agent: &AgentConfig) -> Value {
    let labels = json!({
        "app": APP_LABEL,
        WORK_ITEM_LABEL: sanitize_label(&item.id),
    });
    let env: Vec<Value> = execution_env(item, agent)
        .into_iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    let mut pod_spec = json!({
        "restartPolicy": "Never",
        "enableServiceLinks": false,
        "containers": [{
            "name": "agent",
            "image": config.image,
            "imagePullPolicy": config.pull_policy.as_kubernetes(),
            "command": BranchPlan::for_item(item).wrap_command(&agent.command),
            "workingDir": WORKSPACE_MOUNT,
            "env": env,
            "envFrom": [{ "secretRef": { "name": config.secret_name, "optional": true } }],
            "resources": {
                "limits": { "cpu": config.cpu_limit, "memory": config.memory_limit },
            },
            "volumeMounts": [{ "name": "workspace", "mountPath": WORKSPACE_MOUNT }],
        }],
        "volumes": [{ "name": "workspace", "emptyDir": {} }],
    });
    if let Some(account) = &config.service_account {
        pod_spec["serviceAccountName"] = json!(account);
    }

    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": job_name(&item.id),
            "labels": labels,
            "annotations": { WORK_ITEM_ID_ANNOTATION: item.id },
        },
        "spec": {
            "backoffLimit": 0,
            "ttlSecondsAfterFinished": config.ttl_seconds_after_finished,
            "template": {
                "metadata": { "labels": labels },
                "spec": pod_spec,
            },
        },
    })
}

fn handle_for(item_id: &str, job: String) -> ExecutionHandle {
    ExecutionHandle {
        item_id: item_id.to_owned(),
        id: job,
        started_at: Utc::now(),
        workspace: None,
    }
}

fn in_cluster_server() -> Option<String> {
    let host = env::var("KUBERNETES_SERVICE_HOST").ok()?;
    let port = env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_owned());
    if host.contains(':') {
        Some(format!("https://[{host}]:{port}"))
    } else {
        Some(format!("https://{host}:{port}"))
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|raw| raw.trim().to_owned())
        .filter(|value| !value.is_empty())
}

// ── Wire types ──────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct JobList {
    #[serde(default)]
    items: Vec<Job>,
}

#[derive(Debug, Deserialize)]
struct Job {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    status: JobStatus,
}

impl Job {
    /// Whether the job runs `item_id`. Jobs without the annotation are
    /// matched by name alone.
    fn serves(&self, item_id: &str) -> bool {
        self.metadata.item_id().is_none_or(|owner| owner == item_id)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JobStatus {
    active: u32,
    succeeded: u32,
    failed: u32,
}

impl JobStatus {
    /// Active, or not yet scheduled; anything finished is not running.
    fn is_running(&self) -> bool {
        self.active > 0 || (self.succeeded == 0 && self.failed == 0)
    }
}

#[derive(Debug, Default, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: ObjectMeta,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ObjectMeta {
    name: String,
    annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    fn item_id(&self) -> Option<&str> {
        self.annotations
            .get(WORK_ITEM_ID_ANNOTATION)
            .map(String::as_str)
    }
}
