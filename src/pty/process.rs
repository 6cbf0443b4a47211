//! Pipe-backed process manager.
//!
//! Spawns provider processes with:
//! - `kill_on_drop(true)` so orphaned processes are reaped with the runner.
//! - `env_clear()` plus [`ALLOWED_ENV_VARS`] so the control-plane token and
//!   other runner secrets never reach the provider.
//! - One reader task per output stream and a monitor task that emits
//!   [`PtyEvent::Exit`] only after both readers drained.
//!
//! Pipes carry no window size, so [`PtyManager::resize`] only records the
//! requested geometry.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::pty::{OutputStream, PtyEvent, PtyFuture, PtyManager, PtyProcess, Signal, SpawnRequest};
use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables inherited by provider processes.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "TERM",
    "SHELL",
    "TMPDIR",
    "XDG_CONFIG_HOME",
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

const EVENT_CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK_BYTES: usize = 8192;

struct ProcessEntry {
    pid: u32,
    stdin: Option<Arc<tokio::sync::Mutex<ChildStdin>>>,
    kill_tx: Option<oneshot::Sender<()>>,
    size: (u16, u16),
}

type ProcessMap = Arc<Mutex<HashMap<String, ProcessEntry>>>;

/// [`PtyManager`] backed by `tokio::process` with piped stdio.
#[derive(Clone, Default)]
pub struct ProcessPtyManager {
    processes: ProcessMap,
}

impl ProcessPtyManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last recorded terminal size for a session.
    #[must_use]
    pub fn size(&self, session_id: &str) -> Option<(u16, u16)> {
        lock(&self.processes).get(session_id).map(|entry| entry.size)
    }

    async fn spawn_inner(&self, session_id: &str, request: SpawnRequest) -> Result<PtyProcess> {
        if lock(&self.processes).contains_key(session_id) {
            return Err(AppError::AlreadyExists(format!(
                "process for session {session_id} already running"
            )));
        }

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args);

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.envs(&request.env);
        cmd.env("AGENT_RUNNER_SESSION_ID", session_id);

        cmd.current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Adapter(format!("failed to spawn {}: {err}", request.command))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| AppError::Adapter("spawned process has no pid".into()))?;
        let stdin = child.stdin.take().map(|s| Arc::new(tokio::sync::Mutex::new(s)));
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Adapter("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Adapter("failed to capture stderr".into()))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (kill_tx, kill_rx) = oneshot::channel();

        lock(&self.processes).insert(
            session_id.to_owned(),
            ProcessEntry {
                pid,
                stdin,
                kill_tx: Some(kill_tx),
                size: (80, 24),
            },
        );

        let readers = vec![
            spawn_reader(session_id.to_owned(), OutputStream::Stdout, stdout, tx.clone()),
            spawn_reader(session_id.to_owned(), OutputStream::Stderr, stderr, tx.clone()),
        ];

        let processes = Arc::clone(&self.processes);
        let sid = session_id.to_owned();
        let span = info_span!("pty_monitor", session_id = %sid, pid);
        tokio::spawn(
            async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    Ok(()) = kill_rx => {
                        if let Err(err) = child.kill().await {
                            warn!(%err, "forced kill failed");
                        }
                        child.wait().await
                    }
                };

                let exit_code = match status {
                    Ok(status) => status.code(),
                    Err(err) => {
                        warn!(%err, "error waiting for provider process");
                        None
                    }
                };

                for reader in readers {
                    if let Err(err) = reader.await {
                        warn!(%err, "output reader task failed");
                    }
                }

                {
                    let mut map = lock(&processes);
                    if map.get(&sid).is_some_and(|entry| entry.pid == pid) {
                        map.remove(&sid);
                    }
                }

                info!(?exit_code, "provider process exited");
                if tx
                    .send(PtyEvent::Exit {
                        session_id: sid,
                        exit_code,
                    })
                    .await
                    .is_err()
                {
                    debug!("exit event receiver dropped");
                }
            }
            .instrument(span),
        );

        info!(session_id, pid, command = %request.command, "spawned provider process");
        Ok(PtyProcess { pid, events: rx })
    }

    async fn write_inner(&self, session_id: &str, data: &[u8]) -> Result<()> {
        let stdin = {
            let map = lock(&self.processes);
            let entry = map
                .get(session_id)
                .ok_or_else(|| AppError::NotFound(format!("no process for session {session_id}")))?;
            entry
                .stdin
                .clone()
                .ok_or_else(|| AppError::Adapter("process stdin is closed".into()))?
        };

        let mut guard = stdin.lock().await;
        guard
            .write_all(data)
            .await
            .map_err(|err| AppError::Adapter(format!("failed to write input: {err}")))?;
        guard
            .flush()
            .await
            .map_err(|err| AppError::Adapter(format!("failed to flush input: {err}")))
    }

    fn kill_inner(&self, session_id: &str, signal: Signal) -> Result<()> {
        let mut map = lock(&self.processes);
        let Some(entry) = map.get_mut(session_id) else {
            return Ok(());
        };

        match signal {
            Signal::Terminate => terminate(entry),
            Signal::Kill => {
                if let Some(kill_tx) = entry.kill_tx.take() {
                    // Receiver is gone once the monitor saw the exit.
                    let _ = kill_tx.send(());
                }
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
fn terminate(entry: &mut ProcessEntry) -> Result<()> {
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid;

    let raw = i32::try_from(entry.pid)
        .map_err(|_| AppError::Adapter(format!("pid {} out of range", entry.pid)))?;
    match kill(Pid::from_raw(raw), NixSignal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(err) => Err(AppError::Adapter(format!("failed to send SIGTERM: {err}"))),
    }
}

#[cfg(not(unix))]
fn terminate(entry: &mut ProcessEntry) -> Result<()> {
    if let Some(kill_tx) = entry.kill_tx.take() {
        let _ = kill_tx.send(());
    }
    Ok(())
}

impl PtyManager for ProcessPtyManager {
    fn spawn<'a>(&'a self, session_id: &'a str, request: SpawnRequest) -> PtyFuture<'a, PtyProcess> {
        Box::pin(self.spawn_inner(session_id, request))
    }

    fn write<'a>(&'a self, session_id: &'a str, data: &'a [u8]) -> PtyFuture<'a, ()> {
        Box::pin(self.write_inner(session_id, data))
    }

    fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        let mut map = lock(&self.processes);
        let entry = map
            .get_mut(session_id)
            .ok_or_else(|| AppError::NotFound(format!("no process for session {session_id}")))?;
        entry.size = (cols, rows);
        Ok(())
    }

    fn kill<'a>(&'a self, session_id: &'a str, signal: Signal) -> PtyFuture<'a, ()> {
        let result = self.kill_inner(session_id, signal);
        Box::pin(async move { result })
    }

    fn is_active(&self, session_id: &str) -> bool {
        lock(&self.processes).contains_key(session_id)
    }
}

fn spawn_reader<R>(
    session_id: String,
    stream: OutputStream,
    mut reader: R,
    tx: mpsc::Sender<PtyEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let event = PtyEvent::Data {
                        session_id: session_id.clone(),
                        stream,
                        data: buf[..n].to_vec(),
                        timestamp: Utc::now(),
                    };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(session_id, ?stream, %err, "output read failed");
                    break;
                }
            }
        }
    })
}

fn lock(map: &ProcessMap) -> std::sync::MutexGuard<'_, HashMap<String, ProcessEntry>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}
