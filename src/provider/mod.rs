//! Provider adapter abstraction.
//!
//! A [`ProviderAdapter`] wraps one AI coding CLI and normalises its process
//! I/O into [`ProviderEvent`]s. Each adapter instance drives at most one
//! session at a time. Listeners registered through
//! [`ProviderAdapter::on_event`] are invoked synchronously, in registration
//! order, on the task that produced the event.

pub mod base;
pub mod claude;
pub mod codex;
pub mod generic;
pub mod parse;
pub mod registry;
pub mod subscribers;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::approval::{ApprovalCategory, ApprovalDecision, RiskLevel};
use crate::models::policy::PolicySpec;
use crate::pty::OutputStream;
use crate::{BoxFuture, Result};

pub use base::{CliAdapter, ProviderProfile};
pub use registry::{AdapterFactory, ProviderRegistry};
pub use subscribers::{Listener, SubscriptionId, Subscribers};

/// Result of probing for a provider binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DetectResult {
    /// Whether the binary is runnable.
    pub installed: bool,
    /// Parsed version, `unknown` when unparseable.
    pub version: Option<String>,
    /// Resolved binary path.
    pub path: Option<PathBuf>,
}

/// How far a provider can take work towards a pull request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrFlowDepth {
    /// No git flow support.
    #[default]
    None,
    /// Can commit on a branch.
    Branch,
    /// Can open a pull request.
    PullRequest,
}

/// Optional behaviours a provider supports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCapabilities {
    /// Accepts a task and runs without a human at the keyboard.
    pub non_interactive: bool,
    /// Emits machine-readable JSON lines.
    pub json_output: bool,
    /// Supports MCP servers.
    pub mcp: bool,
    /// Can resume a previous conversation.
    pub resume: bool,
    /// Pull request flow depth.
    pub pr_flow: PrFlowDepth,
}

/// Arguments for [`ProviderAdapter::start_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartArgs {
    /// Session id, used as the PTY correlation id.
    pub session_id: String,
    /// Workspace directory the provider runs in.
    pub repo_path: PathBuf,
    /// Task for the provider.
    pub task: String,
    /// Session policy, rendered into the provider prompt.
    pub policy: PolicySpec,
    /// Extra environment for the provider process.
    pub env: HashMap<String, String>,
}

/// File operation reported by a provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    /// File read.
    Read,
    /// Existing file modified.
    Write,
    /// New file created.
    Create,
    /// File removed.
    Delete,
}

impl FileOperation {
    /// Lowercase name used as the `FILE_TOUCHED` reason.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Create => "create",
            Self::Delete => "delete",
        }
    }

    /// Whether the operation changes the workspace.
    #[must_use]
    pub fn is_mutation(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// Normalised event emitted by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// Process confirmed running.
    Started {
        /// Process id.
        pid: u32,
        /// Detected provider version.
        version: Option<String>,
    },
    /// Raw output chunk.
    Message {
        /// Source stream.
        stream: OutputStream,
        /// Output text.
        text: String,
    },
    /// Provider is blocked on a decision.
    RequestApproval {
        /// Provider-side id, if it exposes one.
        approval_id: Option<String>,
        /// Category of the gated action.
        category: ApprovalCategory,
        /// Risk classification.
        risk: RiskLevel,
        /// What the provider wants to do.
        summary: String,
    },
    /// Provider read or changed files.
    FilesTouched {
        /// Workspace-relative paths.
        paths: Vec<String>,
        /// Operation performed.
        operation: FileOperation,
    },
    /// Summary of a file change.
    DiffHint {
        /// Workspace-relative path.
        path: Option<String>,
        /// Lines added.
        additions: u64,
        /// Lines removed.
        deletions: u64,
        /// Short description.
        summary: String,
    },
    /// Provider invoked a tool.
    ToolRequest {
        /// Tool name.
        tool: String,
        /// Command line for shell tools.
        command: Option<String>,
        /// Classified category.
        category: ApprovalCategory,
    },
    /// Provider reported an error.
    Error {
        /// Message.
        message: String,
        /// Whether the provider cannot continue.
        fatal: bool,
    },
    /// Process exited.
    Stopped {
        /// Exit code, `None` when killed by a signal.
        exit_code: Option<i32>,
        /// Description of the exit.
        reason: String,
    },
}

/// Listener for [`ProviderEvent`]s.
pub type EventListener = Listener<ProviderEvent>;

/// Uniform contract over AI coding CLIs.
pub trait ProviderAdapter: Send + Sync {
    /// Provider id (e.g. `claude-code`).
    fn provider_id(&self) -> &str;

    /// Probe for the provider binary. Never fails; a missing binary yields
    /// `installed: false`.
    fn detect(&self) -> BoxFuture<'_, DetectResult>;

    /// Probe optional behaviours once and cache the result.
    fn capabilities(&self) -> BoxFuture<'_, ProviderCapabilities>;

    /// Spawn the provider for one session and return its pid.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Adapter("Session already active")` when this
    /// instance already drives a live session, or the spawn error.
    fn start_session(&self, args: StartArgs) -> BoxFuture<'_, Result<u32>>;

    /// Forward raw input to the provider.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Adapter` when no session is active or the write
    /// fails.
    fn send_input<'a>(&'a self, data: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Terminate the provider: terminate signal, grace window, then kill.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Adapter` if signal delivery fails.
    fn stop(&self) -> BoxFuture<'_, Result<()>>;

    /// Register an event listener.
    fn on_event(&self, listener: EventListener) -> SubscriptionId;

    /// Remove a listener. Returns whether it was registered.
    fn off_event(&self, id: SubscriptionId) -> bool;

    /// Terminal input that answers a pending approval, if the provider
    /// accepts answers on stdin.
    fn approval_reply(&self, _approval_id: &str, _decision: ApprovalDecision) -> Option<String> {
        None
    }
}

/// Shared adapter handle.
pub type SharedAdapter = Arc<dyn ProviderAdapter>;
