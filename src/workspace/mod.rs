//! Per-session working directories.

pub mod local;
pub mod path_safety;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::models::session::SessionConfig;
use crate::{BoxFuture, Result};

pub use local::LocalWorkspaceManager;

/// Outcome of workspace preparation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    /// Checkout complete; the provider may start.
    Ready,
    /// Checkout failed.
    Failed,
}

/// A prepared (or failed) workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    /// Owning session.
    pub session_id: String,
    /// Directory the provider runs in.
    pub worktree_path: PathBuf,
    /// Preparation outcome.
    pub status: WorkspaceStatus,
    /// Failure detail when `status` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Creates and destroys isolated per-session checkouts.
pub trait WorkspaceManager: Send + Sync {
    /// Prepare the workspace for `config`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Workspace` or `AppError::PathViolation` when the
    /// workspace cannot be created at all.
    fn create_workspace<'a>(&'a self, config: &'a SessionConfig) -> BoxFuture<'a, Result<WorkspaceInfo>>;

    /// Look up a previously created workspace.
    fn get_workspace(&self, session_id: &str) -> Option<WorkspaceInfo>;

    /// Remove a workspace. Unknown sessions are a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Workspace` if the directory cannot be removed.
    fn destroy_workspace<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>>;
}
