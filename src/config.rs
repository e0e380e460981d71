//! Global configuration parsing, validation, and credential loading.
//!
//! Every section is optional: a missing file yields the defaults. Values
//! from the file are overridden by `RECAC_*` / `JIRA_*` / `GITHUB_*`
//! environment variables, and secrets are never read from the file at all.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Keychain service name for stored credentials.
pub const KEYRING_SERVICE: &str = "recac";

/// Where orchestrated agents run.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpawnerMode {
    /// Local containers through the docker CLI.
    #[default]
    Docker,
    /// Jobs on a Kubernetes cluster.
    Kubernetes,
}

impl SpawnerMode {
    /// Parse a mode name; `local` and `k8s` are accepted aliases.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for unknown names.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "docker" | "local" => Ok(Self::Docker),
            "kubernetes" | "k8s" | "cluster" => Ok(Self::Kubernetes),
            other => Err(AppError::Config(format!("unknown orchestrator mode '{other}'"))),
        }
    }
}

/// Where work items come from.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskSourceKind {
    /// Jira search query.
    #[default]
    Jira,
    /// Single JSON array file.
    File,
    /// Directory with one JSON file per item.
    Dir,
    /// GitHub issues of one repository.
    #[serde(rename = "github", alias = "gh")]
    GitHub,
}

impl TaskSourceKind {
    /// Parse a source name; `file-dir` is an accepted alias for `dir`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for unknown names.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "jira" | "tracker" => Ok(Self::Jira),
            "file" => Ok(Self::File),
            "dir" | "file-dir" => Ok(Self::Dir),
            "github" | "gh" => Ok(Self::GitHub),
            other => Err(AppError::Config(format!("unknown task source '{other}'"))),
        }
    }
}

/// When to pull the agent image.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Pull before every spawn.
    #[default]
    Always,
    /// Pull only when the image is missing locally.
    IfNotPresent,
    /// Never pull.
    Never,
}

impl PullPolicy {
    /// Spelling used in Kubernetes pod specs.
    #[must_use]
    pub fn as_kubernetes(self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
        }
    }
}

/// Agent selection handed to every execution.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct AgentConfig {
    /// Provider name exported as `RECAC_PROVIDER`.
    pub provider: String,
    /// Model name exported as `RECAC_MODEL`.
    pub model: String,
    /// Host CLI used for local agent calls (bisect judging).
    pub host_cli: String,
    /// Arguments placed before the prompt.
    pub host_cli_args: Vec<String>,
    /// Command run inside the execution environment after git setup. It
    /// reads its task from the `RECAC_TASK_*` variables.
    pub command: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: "openrouter".into(),
            model: String::new(),
            host_cli: "claude".into(),
            host_cli_args: vec!["-p".into()],
            command: vec!["recac-agent".into()],
        }
    }
}

/// Orchestrator loop tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct OrchestratorConfig {
    /// Execution platform.
    pub mode: SpawnerMode,
    /// Work source.
    pub source: TaskSourceKind,
    /// Seconds between ticks.
    pub interval_seconds: u64,
    /// Sweep finished executions every N ticks.
    pub sweep_every_ticks: u32,
    /// Simultaneous `spawn` calls within one tick.
    pub max_parallel_spawns: usize,
    /// Outstanding executions; 0 means unbounded.
    pub max_active: usize,
    /// Queue file for the `file` source.
    pub work_file: PathBuf,
    /// Drop directory for the `dir` source.
    pub watch_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: SpawnerMode::Docker,
            source: TaskSourceKind::Jira,
            interval_seconds: 60,
            sweep_every_ticks: 1,
            max_parallel_spawns: 4,
            max_active: 0,
            work_file: PathBuf::from("work_items.json"),
            watch_dir: PathBuf::from("tasks"),
        }
    }
}

/// Jira connection settings. The API token is loaded at runtime.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct JiraConfig {
    /// Base URL, e.g. `https://example.atlassian.net`.
    pub url: String,
    /// Account e-mail used for basic auth.
    pub username: String,
    /// Project that new issues are filed in.
    pub project_key: String,
    /// Label marking issues meant for agents.
    pub label: String,
    /// Custom JQL; empty means the label query.
    pub jql: String,
    /// Issue type for submitted items.
    pub issue_type: String,
    /// API token (populated at runtime).
    #[serde(skip)]
    pub api_token: String,
}

impl Default for JiraConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            project_key: String::new(),
            label: "recac-agent".into(),
            jql: String::new(),
            issue_type: "Task".into(),
            api_token: String::new(),
        }
    }
}

impl JiraConfig {
    /// Search query used by the tracker source.
    #[must_use]
    pub fn effective_jql(&self) -> String {
        if self.jql.trim().is_empty() {
            format!(
                "labels = \"{}\" AND statusCategory != Done ORDER BY created ASC",
                self.label
            )
        } else {
            self.jql.clone()
        }
    }
}

/// GitHub Issues settings. The token is loaded at runtime.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct GitHubConfig {
    /// REST API root.
    pub api_url: String,
    /// Repository owner (user or organisation).
    pub owner: String,
    /// Repository name.
    pub repo: String,
    /// Label marking issues meant for agents.
    pub label: String,
    /// API token (populated at runtime).
    #[serde(skip)]
    pub token: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".into(),
            owner: String::new(),
            repo: String::new(),
            label: "recac-agent".into(),
            token: String::new(),
        }
    }
}

/// Local container settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct DockerConfig {
    /// Docker-compatible CLI (`docker`, `podman`).
    pub binary: String,
    /// Agent image.
    pub image: String,
    /// Pull behaviour.
    pub pull_policy: PullPolicy,
    /// Optional network to attach.
    pub network: Option<String>,
    /// Parent directory for per-item workspaces.
    pub workspaces_dir: PathBuf,
    /// Bind `/var/run/docker.sock` into the container.
    pub mount_docker_socket: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".into(),
            image: default_image(),
            pull_policy: PullPolicy::IfNotPresent,
            network: None,
            workspaces_dir: env::temp_dir().join("recac-workspaces"),
            mount_docker_socket: false,
        }
    }
}

/// Cluster job settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct KubernetesConfig {
    /// API server URL; empty means in-cluster discovery.
    pub api_server: String,
    /// Namespace; empty means the service account's namespace.
    pub namespace: String,
    /// Agent image.
    pub image: String,
    /// Pull behaviour.
    pub pull_policy: PullPolicy,
    /// Bearer token file.
    pub token_file: PathBuf,
    /// CA bundle for the API server.
    pub ca_cert: Option<PathBuf>,
    /// Secret injected with `envFrom`.
    pub secret_name: String,
    /// Pod service account.
    pub service_account: Option<String>,
    /// Container CPU limit.
    pub cpu_limit: String,
    /// Container memory limit.
    pub memory_limit: String,
    /// Seconds before finished jobs are garbage collected.
    pub ttl_seconds_after_finished: u32,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_server: String::new(),
            namespace: String::new(),
            image: default_image(),
            pull_policy: PullPolicy::Always,
            token_file: PathBuf::from(SERVICE_ACCOUNT_DIR).join("token"),
            ca_cert: None,
            secret_name: "recac-agent-secrets".into(),
            service_account: None,
            cpu_limit: "1".into(),
            memory_limit: "2Gi".into(),
            ttl_seconds_after_finished: 3600,
        }
    }
}

/// In-cluster service account mount.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

fn default_image() -> String {
    "ghcr.io/process-failed-successfully/recac-agent:latest".into()
}

fn default_sessions_dir() -> PathBuf {
    home_dir().join(".recac").join("sessions")
}

fn default_stop_grace_seconds() -> u64 {
    2
}

fn home_dir() -> PathBuf {
    env::var_os("HOME").map_or_else(env::temp_dir, PathBuf::from)
}

/// Default config location, `~/.recac/config.toml`.
#[must_use]
pub fn default_config_path() -> PathBuf {
    home_dir().join(".recac").join("config.toml")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding session records and logs.
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
    /// Seconds `stop` waits between SIGTERM and SIGKILL.
    #[serde(default = "default_stop_grace_seconds")]
    pub stop_grace_seconds: u64,
    /// Allow starting sessions in dirty workspaces.
    #[serde(default)]
    pub allow_dirty: bool,
    /// Agent selection.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Orchestrator loop settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Jira tracker settings.
    #[serde(default)]
    pub jira: JiraConfig,
    /// GitHub Issues settings.
    #[serde(default)]
    pub github: GitHubConfig,
    /// Local container settings.
    #[serde(default)]
    pub docker: DockerConfig,
    /// Cluster job settings.
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            sessions_dir: default_sessions_dir(),
            stop_grace_seconds: default_stop_grace_seconds(),
            allow_dirty: false,
            agent: AgentConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            jira: JiraConfig::default(),
            github: GitHubConfig::default(),
            docker: DockerConfig::default(),
            kubernetes: KubernetesConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load configuration from `path`, or from the default location when
    /// `None`. A missing default file yields the defaults; environment
    /// overrides are applied in both cases.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if an explicit file is missing, the TOML
    /// is invalid, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::parse(&read_config(path)?)?,
            None => {
                let default = default_config_path();
                if default.exists() {
                    Self::parse(&read_config(&default)?)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&read_config(path.as_ref())?)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config = Self::parse(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Override file values with `RECAC_*`, `JIRA_*`, and `GITHUB_*`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a mode or source variable holds an
    /// unknown value.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(dir) = env_value("RECAC_SESSIONS_DIR") {
            self.sessions_dir = PathBuf::from(dir);
        }
        if let Some(mode) = env_value("RECAC_ORCHESTRATOR_MODE") {
            self.orchestrator.mode = SpawnerMode::parse(&mode)?;
        }
        if let Some(source) = env_value("RECAC_TASK_SOURCE") {
            self.orchestrator.source = TaskSourceKind::parse(&source)?;
        }
        if let Some(file) = env_value("RECAC_WORK_FILE") {
            self.orchestrator.work_file = PathBuf::from(file);
        }
        if let Some(dir) = env_value("RECAC_WATCH_DIR") {
            self.orchestrator.watch_dir = PathBuf::from(dir);
        }
        if let Some(image) = env_value("RECAC_IMAGE") {
            self.docker.image.clone_from(&image);
            self.kubernetes.image = image;
        }
        if let Some(provider) = env_value("RECAC_AGENT_PROVIDER") {
            self.agent.provider = provider;
        }
        if let Some(model) = env_value("RECAC_AGENT_MODEL") {
            self.agent.model = model;
        }
        if let Some(url) = env_value("JIRA_URL") {
            self.jira.url = url;
        }
        if let Some(user) = env_value("JIRA_USERNAME") {
            self.jira.username = user;
        }
        if let Some(key) = env_value("JIRA_PROJECT_KEY") {
            self.jira.project_key = key;
        }
        if let Some(owner) = env_value("GITHUB_OWNER") {
            self.github.owner = owner;
        }
        if let Some(repo) = env_value("GITHUB_REPO") {
            self.github.repo = repo;
        }
        if let Some(label) = env_value("GITHUB_LABEL") {
            self.github.label = label;
        }
        if let Some(namespace) = env_value("RECAC_NAMESPACE") {
            self.kubernetes.namespace = namespace;
        }
        if let Some(secret) = env_value("RECAC_AGENT_SECRET_NAME") {
            self.kubernetes.secret_name = secret;
        }
        Ok(())
    }

    /// Load the API token `kind` needs from the OS keychain with env-var
    /// fallback. Local sources need none.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither the keychain nor
    /// `JIRA_API_TOKEN` / `GITHUB_TOKEN` provides the token.
    pub async fn load_credentials(&mut self, kind: TaskSourceKind) -> Result<()> {
        match kind {
            TaskSourceKind::Jira => {
                self.jira.api_token = load_credential("jira_api_token", "JIRA_API_TOKEN").await?;
            }
            TaskSourceKind::GitHub => {
                self.github.token = load_credential("github_token", "GITHUB_TOKEN").await?;
            }
            TaskSourceKind::File | TaskSourceKind::Dir => {}
        }
        Ok(())
    }

    /// Check that the configuration can drive the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.interval_seconds == 0 {
            return Err(AppError::Config(
                "orchestrator.interval_seconds must be greater than zero".into(),
            ));
        }
        if self.orchestrator.sweep_every_ticks == 0 {
            return Err(AppError::Config(
                "orchestrator.sweep_every_ticks must be greater than zero".into(),
            ));
        }
        if self.orchestrator.max_parallel_spawns == 0 {
            return Err(AppError::Config(
                "orchestrator.max_parallel_spawns must be greater than zero".into(),
            ));
        }
        if self.docker.image.trim().is_empty() || self.kubernetes.image.trim().is_empty() {
            return Err(AppError::Config("agent image must not be empty".into()));
        }
        if !self.github.api_url.starts_with("http") {
            return Err(AppError::Config(format!(
                "github.api_url '{}' must be an http(s) URL",
                self.github.api_url
            )));
        }
        if self.orchestrator.source == TaskSourceKind::Jira
            && !self.jira.url.is_empty()
            && !self.jira.url.starts_with("http")
        {
            return Err(AppError::Config(format!(
                "jira.url '{}' must be an http(s) URL",
                self.jira.url
            )));
        }
        Ok(())
    }

    /// Check the settings the Jira source cannot run without.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the URL or username is missing.
    pub fn require_jira(&self) -> Result<()> {
        if self.jira.url.is_empty() || self.jira.username.is_empty() {
            return Err(AppError::Config(
                "jira.url and jira.username (or JIRA_URL / JIRA_USERNAME) are required".into(),
            ));
        }
        Ok(())
    }

    /// Check the settings the GitHub source cannot run without.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the owner or repository is missing.
    pub fn require_github(&self) -> Result<()> {
        if self.github.owner.is_empty() || self.github.repo.is_empty() {
            return Err(AppError::Config(
                "github.owner and github.repo (or GITHUB_OWNER / GITHUB_REPO) are required".into(),
            ));
        }
        Ok(())
    }
}

fn read_config(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|err| {
        AppError::Config(format!("failed to read config {}: {err}", path.display()))
    })
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env_value(env_key).ok_or_else(|| {
        AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))
    })
}
