//! Inbound control-plane commands.

use serde::{Deserialize, Serialize};

use crate::models::approval::ApprovalDecision;
use crate::models::session::SessionConfig;
use crate::{AppError, Result};

fn default_graceful() -> bool {
    true
}

/// Command addressed to the runner, tagged by `type`.
///
/// ```json
/// {"type":"STOP","sessionId":"sess-1","graceful":false}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum SessionCommand {
    /// Launch a new session.
    Start {
        /// Launch specification.
        config: SessionConfig,
    },
    /// Forward raw input to the provider.
    Input {
        /// Target session.
        session_id: String,
        /// Input text, forwarded verbatim.
        data: String,
    },
    /// Stop a session.
    Stop {
        /// Target session.
        session_id: String,
        /// Graceful stops end `COMPLETED`, others `FAILED`.
        #[serde(default = "default_graceful")]
        graceful: bool,
    },
    /// Pause a running session.
    Pause {
        /// Target session.
        session_id: String,
    },
    /// Resume a paused session.
    Resume {
        /// Target session.
        session_id: String,
    },
    /// Resolve a pending approval.
    Approve {
        /// Target session.
        session_id: String,
        /// Approval being resolved.
        approval_id: String,
        /// Operator decision.
        decision: ApprovalDecision,
        /// Optional operator note.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
}

impl SessionCommand {
    /// Parse and validate a raw JSON command.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` when the JSON is malformed, the tag is
    /// unknown, or a required identifier is blank.
    pub fn parse(raw: &str) -> Result<Self> {
        let command: Self = serde_json::from_str(raw)?;
        command.validate()?;
        Ok(command)
    }

    /// Reject commands with blank identifiers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` describing the first blank field.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Start { config } => config.validate(),
            Self::Approve {
                session_id,
                approval_id,
                ..
            } => {
                require("sessionId", session_id)?;
                require("approvalId", approval_id)
            }
            Self::Input { session_id, .. }
            | Self::Stop { session_id, .. }
            | Self::Pause { session_id }
            | Self::Resume { session_id } => require("sessionId", session_id),
        }
    }

    /// Session the command targets.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::Start { config } => &config.session_id,
            Self::Input { session_id, .. }
            | Self::Stop { session_id, .. }
            | Self::Pause { session_id }
            | Self::Resume { session_id }
            | Self::Approve { session_id, .. } => session_id,
        }
    }

    /// Wire tag of the command.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "START",
            Self::Input { .. } => "INPUT",
            Self::Stop { .. } => "STOP",
            Self::Pause { .. } => "PAUSE",
            Self::Resume { .. } => "RESUME",
            Self::Approve { .. } => "APPROVE",
        }
    }
}

fn require(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{name} must not be empty")));
    }
    Ok(())
}
