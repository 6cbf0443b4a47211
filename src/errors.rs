//! Error types shared across the runner.

use std::fmt::{Display, Formatter};

/// Shared runner result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Runner error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed command or input payload.
    Validation(String),
    /// Requested session or approval does not exist.
    NotFound(String),
    /// A session with the same identifier is already registered.
    AlreadyExists(String),
    /// The session manager has not been initialised (or was shut down).
    NotInitialized(String),
    /// The configured session capacity is exhausted.
    Capacity(String),
    /// The requested lifecycle transition is illegal in the current state.
    InvalidTransition(String),
    /// Provider process or adapter failure.
    Adapter(String),
    /// Workspace preparation or teardown failure.
    Workspace(String),
    /// Control-plane connection failure.
    Transport(String),
    /// A denylisted action was detected.
    PolicyViolation(String),
    /// File system path failed validation against the workspace root.
    PathViolation(String),
    /// Local IPC communication failure.
    Ipc(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            Self::NotInitialized(msg) => write!(f, "not initialized: {msg}"),
            Self::Capacity(msg) => write!(f, "capacity: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::Adapter(msg) => write!(f, "adapter: {msg}"),
            Self::Workspace(msg) => write!(f, "workspace: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::PolicyViolation(msg) => write!(f, "policy violation: {msg}"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("invalid json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
