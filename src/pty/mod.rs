//! Terminal process management.
//!
//! [`PtyManager`] spawns provider processes keyed by session id and exposes
//! their output as [`PtyEvent`]s over an mpsc channel. The final event for
//! a process is always [`PtyEvent::Exit`], sent after all output has been
//! delivered.

pub mod process;

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{BoxFuture, Result};

pub use process::ProcessPtyManager;

/// Boxed future returned by [`PtyManager`] methods.
pub type PtyFuture<'a, T> = BoxFuture<'a, Result<T>>;

/// Output stream a chunk came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Signal delivered by [`PtyManager::kill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Polite termination (`SIGTERM`).
    Terminate,
    /// Forced termination (`SIGKILL`).
    Kill,
}

/// Process launch request.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    /// Executable to run.
    pub command: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Extra environment variables on top of the allowlist.
    pub env: HashMap<String, String>,
}

/// Event emitted for a spawned process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Output chunk.
    Data {
        /// Correlation id.
        session_id: String,
        /// Source stream.
        stream: OutputStream,
        /// Raw bytes.
        data: Vec<u8>,
        /// Read time.
        timestamp: DateTime<Utc>,
    },
    /// Process exited; no further events follow.
    Exit {
        /// Correlation id.
        session_id: String,
        /// Exit code, `None` when killed by a signal.
        exit_code: Option<i32>,
    },
}

/// A freshly spawned process.
#[derive(Debug)]
pub struct PtyProcess {
    /// OS process id.
    pub pid: u32,
    /// Output and exit events.
    pub events: mpsc::Receiver<PtyEvent>,
}

/// Spawns and controls terminal-backed processes keyed by session id.
pub trait PtyManager: Send + Sync {
    /// Spawn a process for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyExists` if the session already has a live
    /// process, or `AppError::Adapter` if the OS spawn fails.
    fn spawn<'a>(&'a self, session_id: &'a str, request: SpawnRequest) -> PtyFuture<'a, PtyProcess>;

    /// Write raw input to the process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    fn write<'a>(&'a self, session_id: &'a str, data: &'a [u8]) -> PtyFuture<'a, ()>;

    /// Record a new terminal size.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<()>;

    /// Deliver a signal. Unknown or already-exited sessions are a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Adapter` if signal delivery fails.
    fn kill<'a>(&'a self, session_id: &'a str, signal: Signal) -> PtyFuture<'a, ()>;

    /// Whether the session has a live process.
    fn is_active(&self, session_id: &str) -> bool;
}
