//! Session model and lifecycle helpers.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::approval::ApprovalRequest;
use crate::models::event::UsageMetrics;
use crate::models::policy::PolicySpec;
use crate::{AppError, Result};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Registered, nothing started yet.
    Created,
    /// Workspace checkout in progress.
    PreparingWorkspace,
    /// Provider process being launched.
    StartingProvider,
    /// Provider running.
    Running,
    /// Blocked on one or more operator approvals.
    WaitingForApproval,
    /// Paused by an operator.
    PausedByHuman,
    /// Teardown in progress.
    Stopping,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl SessionState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 9] = [
        Self::Created,
        Self::PreparingWorkspace,
        Self::StartingProvider,
        Self::Running,
        Self::WaitingForApproval,
        Self::PausedByHuman,
        Self::Stopping,
        Self::Completed,
        Self::Failed,
    ];

    /// Whether the state is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Created, Self::PreparingWorkspace)
            | (Self::PreparingWorkspace, Self::StartingProvider)
            | (Self::StartingProvider | Self::WaitingForApproval | Self::PausedByHuman, Self::Running)
            | (Self::Running, Self::WaitingForApproval | Self::PausedByHuman)
            | (Self::Stopping, Self::Completed | Self::Failed) => true,
            (from, Self::Stopping) => !from.is_terminal() && from != Self::Stopping,
            _ => false,
        }
    }

    /// Wire name, e.g. `WAITING_FOR_APPROVAL`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::PreparingWorkspace => "PREPARING_WORKSPACE",
            Self::StartingProvider => "STARTING_PROVIDER",
            Self::Running => "RUNNING",
            Self::WaitingForApproval => "WAITING_FOR_APPROVAL",
            Self::PausedByHuman => "PAUSED_BY_HUMAN",
            Self::Stopping => "STOPPING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Revision to check out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Checkout {
    /// Branch to clone.
    #[serde(default)]
    pub branch: Option<String>,
    /// Commit to check out after cloning.
    #[serde(default)]
    pub commit: Option<String>,
}

/// Per-session billing limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BillingLimits {
    /// Maximum billed agent seconds.
    #[serde(default)]
    pub max_agent_seconds: Option<u64>,
    /// Maximum terminal output in KB.
    #[serde(default)]
    pub max_terminal_kb: Option<u64>,
}

/// Immutable launch specification for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Unique session identifier, also used as the PTY correlation id.
    pub session_id: String,
    /// Owning organisation.
    pub org_id: String,
    /// Provider to launch (e.g. `claude-code`).
    pub provider_id: String,
    /// Repository reference (`owner/name`); empty for a scratch workspace.
    #[serde(default)]
    pub repo_ref: String,
    /// Revision to check out.
    #[serde(default)]
    pub checkout: Checkout,
    /// Task handed to the provider.
    pub task: String,
    /// Session policy.
    #[serde(default)]
    pub policy: PolicySpec,
    /// Billing limits.
    #[serde(default)]
    pub billing: BillingLimits,
}

impl SessionConfig {
    /// Validate identifiers and the task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` when a required field is blank.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("sessionId", &self.session_id),
            ("orgId", &self.org_id),
            ("providerId", &self.provider_id),
            ("task", &self.task),
        ] {
            if value.trim().is_empty() {
                return Err(AppError::Validation(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }

    /// Repo reference if one is set.
    #[must_use]
    pub fn repo_ref(&self) -> Option<String> {
        (!self.repo_ref.is_empty()).then(|| self.repo_ref.clone())
    }
}

/// Mutable per-session record owned by the session manager.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRuntimeState {
    /// Current lifecycle state.
    pub state: SessionState,
    /// Workspace directory once prepared.
    pub workspace_path: Option<PathBuf>,
    /// Provider process id once started.
    pub provider_pid: Option<u32>,
    /// Last sequence number handed out.
    pub last_event_seq: u64,
    /// Approvals awaiting a decision, keyed by approval id.
    pub pending_approvals: BTreeMap<String, ApprovalRequest>,
    /// Last recorded error or stop reason.
    pub last_error: Option<String>,
    /// Provider exit code, if it exited.
    pub exit_code: Option<i32>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

impl SessionRuntimeState {
    /// Fresh `CREATED` state.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            state: SessionState::Created,
            workspace_path: None,
            provider_pid: None,
            last_event_seq: 0,
            pending_approvals: BTreeMap::new(),
            last_error: None,
            exit_code: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Default for SessionRuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only snapshot of a session.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Session identifier.
    pub session_id: String,
    /// Owning organisation.
    pub org_id: String,
    /// Provider id.
    pub provider_id: String,
    /// Runtime state copy.
    #[serde(flatten)]
    pub runtime: SessionRuntimeState,
    /// Usage accumulated over the whole session so far.
    pub usage: UsageMetrics,
}

/// Aggregate statistics across the registry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// Registered (non-terminal) sessions.
    pub active: usize,
    /// Configured capacity.
    pub max_sessions: usize,
    /// Session count per state.
    pub by_state: BTreeMap<SessionState, usize>,
    /// Pending approvals across all sessions.
    pub pending_approvals: usize,
}
