//! Session policy evaluator.
//!
//! Classifies provider-requested shell commands and file writes into
//! approval categories and checks them against the session's
//! [`CompiledPolicy`]. Evaluation order for commands:
//!
//! 1. Shell deny list match → [`Verdict::Denied`].
//! 2. Network command under `offline` → denied; under `restricted` → approval.
//! 3. Category listed in `approvalRequired` → [`Verdict::RequiresApproval`].
//! 4. Non-empty allow list with no match → approval as `shell_command`.
//! 5. Otherwise allowed.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info_span};

use crate::models::approval::{ApprovalCategory, RiskLevel};
use crate::models::policy::{CompiledPolicy, DenyAction, NetworkMode, PolicySpec};

/// Outcome of a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The action may proceed.
    Allowed,
    /// The action violates policy; the string names the matched rule.
    Denied(String),
    /// The action needs an operator decision.
    RequiresApproval(ApprovalCategory),
}

/// Evaluates provider actions against one session's policy.
#[derive(Debug, Clone)]
pub struct PolicyEvaluator {
    policy: CompiledPolicy,
}

impl PolicyEvaluator {
    /// Compile `policy` into an evaluator.
    #[must_use]
    pub fn new(policy: PolicySpec) -> Self {
        Self {
            policy: CompiledPolicy::from_policy(policy),
        }
    }

    /// Underlying policy.
    #[must_use]
    pub fn policy(&self) -> &PolicySpec {
        &self.policy.raw
    }

    /// Evaluate a shell command line.
    #[must_use]
    pub fn evaluate_command(&self, command: &str) -> Verdict {
        let _span = info_span!("policy_evaluate_command").entered();
        let command = command.trim();

        if let Some(idx) = self.policy.deny_set.matches(command).iter().next() {
            let rule = self
                .policy
                .deny_patterns
                .get(idx)
                .cloned()
                .unwrap_or_default();
            debug!(%rule, "command matched shell deny list");
            return Verdict::Denied(format!("command '{command}' matches deny rule '{rule}'"));
        }

        let category = classify_command(command);

        if category == ApprovalCategory::Network {
            match self.policy.raw.network_mode {
                NetworkMode::Offline => {
                    return Verdict::Denied(format!(
                        "network command '{command}' not allowed in offline mode"
                    ));
                }
                NetworkMode::Restricted => return Verdict::RequiresApproval(category),
                NetworkMode::Full => {}
            }
        }

        if self.requires_approval(category) {
            return Verdict::RequiresApproval(category);
        }

        if !self.policy.raw.shell_allow.is_empty() && !self.policy.allow_set.is_match(command) {
            return Verdict::RequiresApproval(ApprovalCategory::ShellCommand);
        }

        Verdict::Allowed
    }

    /// Evaluate a write (or delete) of a workspace-relative path.
    #[must_use]
    pub fn evaluate_write(&self, path: &str, delete: bool) -> Verdict {
        for pattern in &self.policy.raw.denied_paths {
            match glob::Pattern::new(pattern) {
                Ok(glob_pat) => {
                    if glob_pat.matches(path) {
                        return Verdict::Denied(format!(
                            "write to '{path}' matches denied path '{pattern}'"
                        ));
                    }
                }
                Err(err) => {
                    tracing::warn!(%pattern, %err, "invalid denied path glob, skipping");
                }
            }
        }

        let category = if delete {
            ApprovalCategory::FileDelete
        } else {
            ApprovalCategory::FileWrite
        };
        if self.requires_approval(category) {
            Verdict::RequiresApproval(category)
        } else {
            Verdict::Allowed
        }
    }

    /// Whether `category` is gated on an operator decision.
    #[must_use]
    pub fn requires_approval(&self, category: ApprovalCategory) -> bool {
        self.policy.raw.approval_required.contains(&category)
    }

    /// Action taken when a request of this shape is denied.
    #[must_use]
    pub fn deny_action(&self, category: ApprovalCategory, risk: RiskLevel) -> DenyAction {
        self.policy.raw.on_deny.action_for(category, risk)
    }
}

/// Ordered classification rules; the first match wins.
fn command_rules() -> &'static [(Regex, ApprovalCategory)] {
    static RULES: OnceLock<Vec<(Regex, ApprovalCategory)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (r"(^|[;&|]\s*)git\s+push\b", ApprovalCategory::GitPush),
            (r"(^|[;&|]\s*)git\s+commit\b", ApprovalCategory::GitCommit),
            (
                r"(^|[;&|]\s*)(npm\s+(install|i|add)|yarn\s+add|pnpm\s+(add|install|i)|pip3?\s+install|cargo\s+(add|install)|go\s+get|gem\s+install|bundle\s+add)\b",
                ApprovalCategory::DependencyInstall,
            ),
            (
                r"(^|[;&|]\s*)(curl|wget|ssh|scp|nc|telnet)\b",
                ApprovalCategory::Network,
            ),
            (r"(^|[;&|]\s*)(rm|rmdir|unlink)\b", ApprovalCategory::FileDelete),
        ]
        .into_iter()
        .filter_map(|(pattern, category)| Regex::new(pattern).ok().map(|re| (re, category)))
        .collect()
    })
}

/// Classify a shell command into an approval category.
///
/// Anything not matching a specific rule is a plain `shell_command`.
#[must_use]
pub fn classify_command(command: &str) -> ApprovalCategory {
    let command = command.trim();
    command_rules()
        .iter()
        .find(|(re, _)| re.is_match(command))
        .map_or(ApprovalCategory::ShellCommand, |(_, category)| *category)
}
