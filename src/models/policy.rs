//! Session policy model.

use std::collections::{BTreeMap, BTreeSet};

use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::models::approval::{ApprovalCategory, RiskLevel};

/// Outbound network posture for a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// No restrictions.
    #[default]
    Full,
    /// Network commands require approval.
    Restricted,
    /// Network commands are policy violations.
    Offline,
}

/// What happens to a session when an approval is denied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DenyAction {
    /// Return to `RUNNING` once no approvals remain.
    #[default]
    Resume,
    /// Force the session into `STOPPING`.
    Stop,
}

/// Deny-decision behaviour, configurable per category and risk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DenyBehavior {
    /// Fallback action.
    #[serde(default)]
    pub default: DenyAction,
    /// Per-category overrides.
    #[serde(default)]
    pub categories: BTreeMap<ApprovalCategory, DenyAction>,
    /// Denials at or above this risk always stop the session.
    #[serde(default)]
    pub stop_at_risk: Option<RiskLevel>,
}

impl DenyBehavior {
    /// Resolve the action for a denied request.
    #[must_use]
    pub fn action_for(&self, category: ApprovalCategory, risk: RiskLevel) -> DenyAction {
        if self.stop_at_risk.is_some_and(|threshold| risk >= threshold) {
            return DenyAction::Stop;
        }
        self.categories
            .get(&category)
            .copied()
            .unwrap_or(self.default)
    }
}

/// Read-only session policy supplied by the control plane.
///
/// Never relaxed at runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// Shell command patterns (regex) that are explicitly allowed. When
    /// non-empty, commands matching none of them require approval.
    #[serde(default)]
    pub shell_allow: Vec<String>,
    /// Shell command patterns (regex) that are policy violations.
    #[serde(default)]
    pub shell_deny: Vec<String>,
    /// Categories that must be approved by an operator.
    #[serde(default)]
    pub approval_required: BTreeSet<ApprovalCategory>,
    /// Network posture.
    #[serde(default)]
    pub network_mode: NetworkMode,
    /// Glob patterns (workspace-relative) that must never be written.
    #[serde(default)]
    pub denied_paths: Vec<String>,
    /// Deny-decision behaviour.
    #[serde(default)]
    pub on_deny: DenyBehavior,
}

/// Pre-compiled form of [`PolicySpec`] with shell patterns compiled into
/// [`RegexSet`]s for efficient matching.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    /// Original policy data.
    pub raw: PolicySpec,
    /// Compiled allow patterns.
    pub allow_set: RegexSet,
    /// Compiled deny patterns.
    pub deny_set: RegexSet,
    /// Deny pattern strings, parallel to [`Self::deny_set`].
    pub deny_patterns: Vec<String>,
}

impl CompiledPolicy {
    /// Compile a [`PolicySpec`].
    ///
    /// Invalid allow patterns are skipped with a warning. Invalid deny
    /// patterns are kept as escaped literals so a typo never loosens the
    /// deny list.
    #[must_use]
    pub fn from_policy(raw: PolicySpec) -> Self {
        let allow_patterns: Vec<String> = raw
            .shell_allow
            .iter()
            .filter(|p| {
                let ok = regex::Regex::new(p).is_ok();
                if !ok {
                    tracing::warn!(pattern = %p, "invalid regex in shell allow list, skipping");
                }
                ok
            })
            .cloned()
            .collect();

        let deny_patterns: Vec<String> = raw
            .shell_deny
            .iter()
            .map(|p| {
                if regex::Regex::new(p).is_ok() {
                    p.clone()
                } else {
                    tracing::warn!(pattern = %p, "invalid regex in shell deny list, matching literally");
                    regex::escape(p)
                }
            })
            .collect();

        let allow_set = RegexSet::new(&allow_patterns).unwrap_or_else(|_| RegexSet::empty());
        let deny_set = RegexSet::new(&deny_patterns).unwrap_or_else(|_| RegexSet::empty());

        Self {
            raw,
            allow_set,
            deny_set,
            deny_patterns,
        }
    }
}
