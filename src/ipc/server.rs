//! Local IPC server for `agent-runner-ctl`.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. One JSON request per line, one JSON
//! response per line.
//!
//! ## Protocol
//!
//! ```json
//! {"command": "list", "auth_token": "..."}
//! {"command": "info", "auth_token": "..."}
//! {"command": "dispatch", "auth_token": "...", "payload": {"type": "PAUSE", "sessionId": "sess-1"}}
//! ```
//!
//! ```json
//! {"ok": true, "data": { ... }}
//! {"ok": false, "error": "not found: session sess-9 not found"}
//! ```

use std::path::Path;
use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::models::command::SessionCommand;
use crate::runner::Runner;
use crate::{AppError, Result};

#[derive(Debug, Deserialize)]
struct IpcRequest {
    command: String,
    auth_token: Option<String>,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

/// Response line sent back to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Generate a fresh token and write it to `path` (owner-only on unix).
///
/// # Errors
///
/// Returns `AppError::Ipc` if the file cannot be written.
pub fn write_token_file(path: &Path) -> Result<String> {
    let token = uuid::Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| AppError::Ipc(format!("cannot create token directory: {err}")))?;
    }
    std::fs::write(path, &token)
        .map_err(|err| AppError::Ipc(format!("cannot write token file: {err}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|err| AppError::Ipc(format!("cannot restrict token file: {err}")))?;
    }
    Ok(token)
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    runner: Arc<Runner>,
    name: String,
    token: String,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let token = Arc::new(token);
    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tokio::spawn(handle_connection(
                                    stream,
                                    Arc::clone(&runner),
                                    Arc::clone(&token),
                                ));
                            }
                            Err(err) => warn!(%err, "IPC accept failed"),
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    runner: Arc<Runner>,
    token: Arc<String>,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let response = handle_request(trimmed, &runner, &token).await;
                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Authenticate and execute one request line.
pub async fn handle_request(line: &str, runner: &Runner, token: &str) -> IpcResponse {
    let request = match serde_json::from_str::<IpcRequest>(line) {
        Ok(request) => request,
        Err(err) => return IpcResponse::error(format!("invalid json: {err}")),
    };

    let span = info_span!("ipc_command", command = %request.command);
    async {
        if request.auth_token.as_deref() != Some(token) {
            warn!("IPC request rejected: invalid auth token");
            return IpcResponse::error("unauthorized");
        }

        match request.command.as_str() {
            "list" => match serde_json::to_value(runner.sessions().get_active_sessions()) {
                Ok(sessions) => IpcResponse::success(serde_json::json!({ "sessions": sessions })),
                Err(err) => IpcResponse::error(format!("failed to list sessions: {err}")),
            },
            "info" => match serde_json::to_value(runner.runner_info()) {
                Ok(info) => IpcResponse::success(info),
                Err(err) => IpcResponse::error(format!("failed to describe runner: {err}")),
            },
            "dispatch" => {
                let Some(payload) = request.payload else {
                    return IpcResponse::error("missing required 'payload' field");
                };
                let command = match serde_json::from_value::<SessionCommand>(payload)
                    .map_err(AppError::from)
                    .and_then(|command| command.validate().map(|()| command))
                {
                    Ok(command) => command,
                    Err(err) => return IpcResponse::error(err.to_string()),
                };
                let name = command.name();
                let session_id = command.session_id().to_owned();
                match runner.dispatch(command).await {
                    Ok(()) => {
                        info!(command = name, %session_id, "command applied via IPC");
                        IpcResponse::success(
                            serde_json::json!({ "command": name, "sessionId": session_id }),
                        )
                    }
                    Err(err) => IpcResponse::error(err.to_string()),
                }
            }
            other => IpcResponse::error(format!("unknown command: {other}")),
        }
    }
    .instrument(span)
    .await
}
