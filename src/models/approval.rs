//! Approval request model for gated provider actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Risk classification for a gated action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Unlikely to cause harm.
    Low,
    /// Worth a look before proceeding.
    Medium,
    /// Requires careful review.
    High,
    /// Affects shared or irreversible state.
    Critical,
}

/// Category of action a provider wants to perform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalCategory {
    /// Writing or editing a file.
    FileWrite,
    /// Deleting a file.
    FileDelete,
    /// Running an arbitrary shell command.
    ShellCommand,
    /// Creating a git commit.
    GitCommit,
    /// Pushing to a remote.
    GitPush,
    /// Installing or adding a dependency.
    DependencyInstall,
    /// Outbound network access.
    Network,
    /// Anything the provider asked about that fits no other category.
    Other,
}

impl ApprovalCategory {
    /// Default risk attached to a category when the provider gives none.
    #[must_use]
    pub fn default_risk(self) -> RiskLevel {
        match self {
            Self::FileWrite | Self::ShellCommand | Self::Other => RiskLevel::Low,
            Self::GitCommit | Self::DependencyInstall | Self::Network => RiskLevel::Medium,
            Self::FileDelete | Self::GitPush => RiskLevel::High,
        }
    }
}

/// Operator decision on an approval request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Action allowed.
    #[serde(alias = "approve", alias = "APPROVE", alias = "APPROVED")]
    Approved,
    /// Action refused.
    #[serde(alias = "deny", alias = "DENY", alias = "DENIED")]
    Denied,
    /// Request withdrawn because the session is stopping.
    #[serde(alias = "cancel", alias = "CANCELLED")]
    Cancelled,
}

impl ApprovalDecision {
    /// Lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A provider action awaiting an operator decision.
///
/// Lives only inside the owning session's pending map and is resolved
/// exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Unique request identifier.
    pub id: String,
    /// Owning session identifier.
    pub session_id: String,
    /// What kind of action is gated.
    pub category: ApprovalCategory,
    /// Risk classification.
    pub risk: RiskLevel,
    /// Human-readable description of the action.
    pub summary: String,
    /// When the request was raised.
    pub requested_at: DateTime<Utc>,
    /// When the request was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Final decision.
    pub decision: Option<ApprovalDecision>,
}

impl ApprovalRequest {
    /// Construct a new pending approval request.
    ///
    /// A provider-supplied id is kept so replies can be correlated; otherwise
    /// a fresh UUID is generated.
    #[must_use]
    pub fn new(
        id: Option<String>,
        session_id: String,
        category: ApprovalCategory,
        risk: RiskLevel,
        summary: String,
    ) -> Self {
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            session_id,
            category,
            risk,
            summary,
            requested_at: Utc::now(),
            resolved_at: None,
            decision: None,
        }
    }

    /// Stamp the decision and resolution time.
    pub fn resolve(&mut self, decision: ApprovalDecision) {
        self.decision = Some(decision);
        self.resolved_at = Some(Utc::now());
    }
}
