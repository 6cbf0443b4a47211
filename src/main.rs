#![forbid(unsafe_code)]

//! `agent-runner`: session orchestration daemon.
//!
//! Bootstraps configuration, wires providers, workspaces and the session
//! manager to the control-plane event stream, and serves the local health
//! endpoint and the IPC socket for `agent-runner-ctl`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_runner::ipc::server::{spawn_ipc_server, write_token_file};
use agent_runner::orchestrator::{SessionManager, SessionManagerOptions};
use agent_runner::provider::ProviderRegistry;
use agent_runner::pty::process::ProcessPtyManager;
use agent_runner::runner::Runner;
use agent_runner::stream::{EventStream, EventStreamOptions, TcpTransport};
use agent_runner::workspace::local::LocalWorkspaceManager;
use agent_runner::{health, AppError, Result, RunnerConfig};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-runner", about = "AI coding session runner", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override `max_sessions` from the config file.
    #[arg(long)]
    max_sessions: Option<u32>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-runner bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = RunnerConfig::load_from_path(&args.config)?;
    if let Some(max) = args.max_sessions {
        if max == 0 {
            return Err(AppError::Config("--max-sessions must be greater than zero".into()));
        }
        config.max_sessions = max;
    }
    if config.control_plane.token.is_empty() {
        config.load_credentials().await?;
    }
    info!(runner_id = %config.runner_id, mode = ?config.mode, "configuration loaded");

    // ── Build components ────────────────────────────────
    let pty = Arc::new(ProcessPtyManager::new());
    let providers = Arc::new(
        ProviderRegistry::new(pty, config.providers.clone()).with_stop_grace(config.stop_grace()),
    );
    let workspaces = Arc::new(LocalWorkspaceManager::new(&config.workspace));
    let sessions = SessionManager::new(SessionManagerOptions::from_config(&config), workspaces);

    let transport = Arc::new(TcpTransport::new(
        config.control_plane.address.clone(),
        std::time::Duration::from_secs(config.control_plane.connect_timeout_seconds),
    ));
    let stream = EventStream::new(EventStreamOptions::from_config(&config), transport);

    let runner = Arc::new(Runner::new(config.clone(), sessions, stream, providers));
    runner.start().await?;

    // ── Local surfaces ──────────────────────────────────
    let ct = CancellationToken::new();

    let health_handle = (config.http_port > 0).then(|| {
        let runner = Arc::clone(&runner);
        let ct = ct.clone();
        let port = config.http_port;
        tokio::spawn(async move {
            if let Err(err) = health::serve(runner, port, ct).await {
                error!(%err, "health endpoint failed");
            }
        })
    });

    let ipc_handle = match write_token_file(&config.ipc_token_path()).and_then(|token| {
        spawn_ipc_server(
            Arc::clone(&runner),
            config.ipc_name.clone(),
            token,
            ct.clone(),
        )
    }) {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(%err, "IPC server unavailable; continuing without local control");
            None
        }
    };

    info!("agent-runner ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");

    runner.shutdown().await;
    ct.cancel();

    for handle in [health_handle, ipc_handle].into_iter().flatten() {
        if let Err(err) = handle.await {
            warn!(%err, "background task ended abnormally");
        }
    }
    if let Err(err) = std::fs::remove_file(config.ipc_token_path()) {
        warn!(%err, "failed to remove ipc token file");
    }
    info!("agent-runner shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
