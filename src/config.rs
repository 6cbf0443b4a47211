//! Runner configuration parsing, validation, and credential loading.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{AppError, Result};

/// Keychain service name used for runner credentials.
pub const KEYRING_SERVICE: &str = "agent-runner";

/// Environment variable consulted when the keychain has no token.
pub const TOKEN_ENV_VAR: &str = "AGENT_RUNNER_TOKEN";

/// Deployment mode reported in heartbeats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunnerMode {
    /// Runner hosted on customer infrastructure.
    #[default]
    SelfHosted,
    /// Runner operated by the control-plane owner.
    Managed,
}

/// Control-plane connectivity settings.
///
/// The auth token is loaded at runtime via OS keychain or environment
/// variable, never from the TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ControlPlaneConfig {
    /// `host:port` of the control-plane event endpoint.
    pub address: String,
    /// Connection attempts before the runner is marked unhealthy.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Fixed delay between connection attempts.
    #[serde(default = "default_retry_delay_millis")]
    pub retry_delay_millis: u64,
    /// Keepalive ping interval.
    #[serde(default = "default_ping_interval_seconds")]
    pub ping_interval_seconds: u64,
    /// Maximum events retained while disconnected.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Timeout for a single connect + auth handshake.
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    /// Auth token (populated at runtime).
    #[serde(skip)]
    pub token: String,
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_retry_delay_millis() -> u64 {
    2000
}

fn default_ping_interval_seconds() -> u64 {
    30
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

/// Workspace checkout settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkspaceConfig {
    /// Directory under which per-session workspaces are created.
    pub root: PathBuf,
    /// Clone URL template; `{repo}` is replaced with the session repo ref.
    #[serde(default = "default_clone_url_template")]
    pub clone_url_template: String,
    /// Git executable.
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
}

fn default_clone_url_template() -> String {
    "https://github.com/{repo}.git".into()
}

fn default_git_binary() -> String {
    "git".into()
}

/// Per-provider overrides.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub struct ProviderOverride {
    /// Binary to launch instead of the provider default.
    pub binary: Option<String>,
    /// Arguments appended after the rendered provider arguments.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_max_sessions() -> u32 {
    10
}

fn default_usage_tick_seconds() -> u64 {
    60
}

fn default_shutdown_timeout_seconds() -> u64 {
    30
}

fn default_stop_grace_millis() -> u64 {
    1000
}

fn default_heartbeat_seconds() -> u64 {
    30
}

fn default_ipc_name() -> String {
    "agent-runner".into()
}

fn default_true() -> bool {
    true
}

/// Runner configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RunnerConfig {
    /// Identifier reported to the control plane.
    pub runner_id: String,
    /// Deployment mode.
    #[serde(default)]
    pub mode: RunnerMode,
    /// Maximum concurrently active sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,
    /// Hard session timeout; 0 disables it.
    #[serde(default)]
    pub session_timeout_seconds: u64,
    /// Usage tick interval.
    #[serde(default = "default_usage_tick_seconds")]
    pub usage_tick_seconds: u64,
    /// Upper bound for stopping every session on shutdown.
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
    /// Grace window between terminate and kill signals.
    #[serde(default = "default_stop_grace_millis")]
    pub stop_grace_millis: u64,
    /// Heartbeat interval.
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
    /// Health endpoint port; 0 disables the endpoint.
    #[serde(default)]
    pub http_port: u16,
    /// Named pipe / Unix socket identifier.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Forward raw provider output as `TERMINAL_OUTPUT` events.
    #[serde(default = "default_true")]
    pub forward_terminal_output: bool,
    /// Watch workspaces for file changes.
    #[serde(default)]
    pub watch_workspace_files: bool,
    /// Control-plane connectivity.
    pub control_plane: ControlPlaneConfig,
    /// Workspace checkout settings.
    pub workspace: WorkspaceConfig,
    /// Provider overrides keyed by provider id.
    #[serde(default)]
    pub providers: HashMap<String, ProviderOverride>,
}

impl RunnerConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the control-plane token from OS keychain with env-var fallback.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if neither keychain nor env var provide
    /// the token.
    pub async fn load_credentials(&mut self) -> Result<()> {
        self.control_plane.token = load_credential("control_plane_token", TOKEN_ENV_VAR).await?;
        Ok(())
    }

    /// Session timeout, if one is configured.
    #[must_use]
    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session_timeout_seconds > 0).then(|| Duration::from_secs(self.session_timeout_seconds))
    }

    /// Usage tick interval.
    #[must_use]
    pub fn usage_tick_interval(&self) -> Duration {
        Duration::from_secs(self.usage_tick_seconds)
    }

    /// Grace window between terminate and kill.
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_millis)
    }

    /// Path of the file holding the local IPC auth token.
    #[must_use]
    pub fn ipc_token_path(&self) -> PathBuf {
        self.workspace.root.join(".agent-runner").join("ipc-token")
    }

    fn validate(&mut self) -> Result<()> {
        if self.runner_id.trim().is_empty() {
            return Err(AppError::Config("runner_id must not be empty".into()));
        }

        if self.max_sessions == 0 {
            return Err(AppError::Config(
                "max_sessions must be greater than zero".into(),
            ));
        }

        if self.usage_tick_seconds == 0 || self.heartbeat_seconds == 0 {
            return Err(AppError::Config(
                "usage_tick_seconds and heartbeat_seconds must be greater than zero".into(),
            ));
        }

        if self.control_plane.connect_attempts == 0 {
            return Err(AppError::Config(
                "control_plane.connect_attempts must be greater than zero".into(),
            ));
        }

        if self.control_plane.ping_interval_seconds == 0 {
            return Err(AppError::Config(
                "control_plane.ping_interval_seconds must be greater than zero".into(),
            ));
        }

        if self.control_plane.buffer_capacity == 0 {
            return Err(AppError::Config(
                "control_plane.buffer_capacity must be greater than zero".into(),
            ));
        }

        if !self.workspace.clone_url_template.contains("{repo}") {
            return Err(AppError::Config(
                "workspace.clone_url_template must contain {repo}".into(),
            ));
        }

        fs::create_dir_all(&self.workspace.root)
            .map_err(|err| AppError::Config(format!("workspace.root invalid: {err}")))?;
        self.workspace.root = self
            .workspace
            .root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace.root invalid: {err}")))?;

        Ok(())
    }
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

    match env::var(env_key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))),
    }
}
