//! Outbound runner events.
//!
//! Every [`RunnerEvent`] carries the session envelope (`sessionId`, `orgId`,
//! `ts`, `seq`, optional `repoRef`) and one [`RunnerEventPayload`] variant,
//! serialised flat with a SCREAMING_SNAKE_CASE `type` tag:
//!
//! ```json
//! {"type":"FILE_TOUCHED","path":"a.ts","reason":"read",
//!  "sessionId":"sess-1","orgId":"org-1","ts":"...","seq":7}
//! ```

use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::approval::{ApprovalDecision, ApprovalRequest};
use crate::models::session::SessionState;
use crate::pty::OutputStream;

/// Interval- or session-scoped usage metrics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetrics {
    /// Seconds spent in `RUNNING`.
    pub agent_seconds: f64,
    /// Provider output volume in KB.
    pub terminal_kb: f64,
    /// Distinct files touched.
    pub files_touched: u64,
    /// Commands run by the provider.
    pub commands_run: u64,
    /// Approvals requested.
    pub approvals_requested: u64,
}

impl UsageMetrics {
    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agent_seconds <= 0.0
            && self.terminal_kb <= 0.0
            && self.files_touched == 0
            && self.commands_run == 0
            && self.approvals_requested == 0
    }
}

impl AddAssign for UsageMetrics {
    fn add_assign(&mut self, rhs: Self) {
        self.agent_seconds += rhs.agent_seconds;
        self.terminal_kb += rhs.terminal_kb;
        self.files_touched += rhs.files_touched;
        self.commands_run += rhs.commands_run;
        self.approvals_requested += rhs.approvals_requested;
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionOutcome {
    /// Ended in `COMPLETED`.
    Completed,
    /// Ended in `FAILED`.
    Failed,
}

impl SessionOutcome {
    /// Terminal state corresponding to the outcome.
    #[must_use]
    pub fn state(self) -> SessionState {
        match self {
            Self::Completed => SessionState::Completed,
            Self::Failed => SessionState::Failed,
        }
    }
}

/// Variant-specific event data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum RunnerEventPayload {
    /// Lifecycle transition.
    SessionStateChanged {
        /// Previous state.
        from: SessionState,
        /// New state.
        to: SessionState,
        /// Why the transition happened, for unplanned transitions.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Provider process confirmed running.
    SessionStarted {
        /// Provider id.
        provider_id: String,
        /// Provider process id.
        pid: u32,
        /// Detected provider version.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_version: Option<String>,
    },
    /// Session reached a terminal state and was purged.
    SessionEnded {
        /// Terminal outcome.
        outcome: SessionOutcome,
        /// Provider exit code, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        /// Stop reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Usage aggregated over the whole session.
        usage: UsageMetrics,
    },
    /// Raw provider output chunk.
    TerminalOutput {
        /// Source stream.
        stream: OutputStream,
        /// Output text (lossy UTF-8).
        data: String,
    },
    /// Provider read or wrote a file.
    FileTouched {
        /// Workspace-relative path.
        path: String,
        /// Operation (`read`, `write`, `create`, `delete`).
        reason: String,
    },
    /// Summary of a change to a file.
    DiffSummary {
        /// Workspace-relative path.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        /// Lines added.
        additions: u64,
        /// Lines removed.
        deletions: u64,
        /// Short description.
        summary: String,
    },
    /// Provider ran a tool or command.
    CommandExecuted {
        /// Tool name.
        tool: String,
        /// Command line, for shell tools.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    /// Provider action gated on an operator decision.
    ApprovalRequested {
        /// The request.
        approval: ApprovalRequest,
    },
    /// Operator decision recorded.
    ApprovalResolved {
        /// Resolved request id.
        approval_id: String,
        /// Decision.
        decision: ApprovalDecision,
        /// Operator note.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    /// Provider reported an error.
    ProviderError {
        /// Error message.
        message: String,
        /// Whether the error ends the session.
        fatal: bool,
    },
    /// Interval usage for billing.
    UsageTick {
        /// Interval metrics.
        metrics: UsageMetrics,
    },
}

/// Discriminant of [`RunnerEventPayload`], used for buffering policy and
/// exhaustiveness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RunnerEventKind {
    /// `SESSION_STATE_CHANGED`
    SessionStateChanged,
    /// `SESSION_STARTED`
    SessionStarted,
    /// `SESSION_ENDED`
    SessionEnded,
    /// `TERMINAL_OUTPUT`
    TerminalOutput,
    /// `FILE_TOUCHED`
    FileTouched,
    /// `DIFF_SUMMARY`
    DiffSummary,
    /// `COMMAND_EXECUTED`
    CommandExecuted,
    /// `APPROVAL_REQUESTED`
    ApprovalRequested,
    /// `APPROVAL_RESOLVED`
    ApprovalResolved,
    /// `PROVIDER_ERROR`
    ProviderError,
    /// `USAGE_TICK`
    UsageTick,
}

impl RunnerEventKind {
    /// Every kind.
    pub const ALL: [Self; 11] = [
        Self::SessionStateChanged,
        Self::SessionStarted,
        Self::SessionEnded,
        Self::TerminalOutput,
        Self::FileTouched,
        Self::DiffSummary,
        Self::CommandExecuted,
        Self::ApprovalRequested,
        Self::ApprovalResolved,
        Self::ProviderError,
        Self::UsageTick,
    ];

    /// Wire `type` tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStateChanged => "SESSION_STATE_CHANGED",
            Self::SessionStarted => "SESSION_STARTED",
            Self::SessionEnded => "SESSION_ENDED",
            Self::TerminalOutput => "TERMINAL_OUTPUT",
            Self::FileTouched => "FILE_TOUCHED",
            Self::DiffSummary => "DIFF_SUMMARY",
            Self::CommandExecuted => "COMMAND_EXECUTED",
            Self::ApprovalRequested => "APPROVAL_REQUESTED",
            Self::ApprovalResolved => "APPROVAL_RESOLVED",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::UsageTick => "USAGE_TICK",
        }
    }

    /// Critical kinds are retained ahead of everything else when the
    /// delivery buffer is full.
    #[must_use]
    pub fn is_critical(self) -> bool {
        match self {
            Self::SessionStateChanged
            | Self::SessionStarted
            | Self::SessionEnded
            | Self::ApprovalRequested
            | Self::ApprovalResolved
            | Self::UsageTick => true,
            Self::TerminalOutput
            | Self::FileTouched
            | Self::DiffSummary
            | Self::CommandExecuted
            | Self::ProviderError => false,
        }
    }
}

impl RunnerEventPayload {
    /// Discriminant of this payload.
    #[must_use]
    pub fn kind(&self) -> RunnerEventKind {
        match self {
            Self::SessionStateChanged { .. } => RunnerEventKind::SessionStateChanged,
            Self::SessionStarted { .. } => RunnerEventKind::SessionStarted,
            Self::SessionEnded { .. } => RunnerEventKind::SessionEnded,
            Self::TerminalOutput { .. } => RunnerEventKind::TerminalOutput,
            Self::FileTouched { .. } => RunnerEventKind::FileTouched,
            Self::DiffSummary { .. } => RunnerEventKind::DiffSummary,
            Self::CommandExecuted { .. } => RunnerEventKind::CommandExecuted,
            Self::ApprovalRequested { .. } => RunnerEventKind::ApprovalRequested,
            Self::ApprovalResolved { .. } => RunnerEventKind::ApprovalResolved,
            Self::ProviderError { .. } => RunnerEventKind::ProviderError,
            Self::UsageTick { .. } => RunnerEventKind::UsageTick,
        }
    }
}

/// Event emitted to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerEvent {
    /// Variant data, flattened alongside the envelope.
    #[serde(flatten)]
    pub payload: RunnerEventPayload,
    /// Session the event belongs to.
    pub session_id: String,
    /// Owning organisation.
    pub org_id: String,
    /// Emission time.
    pub ts: DateTime<Utc>,
    /// Per-session sequence number, strictly increasing.
    pub seq: u64,
    /// Repository reference, when the session has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_ref: Option<String>,
}

impl RunnerEvent {
    /// Discriminant of the payload.
    #[must_use]
    pub fn kind(&self) -> RunnerEventKind {
        self.payload.kind()
    }

    /// Whether the event is retained ahead of others when buffering.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.kind().is_critical()
    }
}
