//! Heartbeat payload describing this runner instance.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RunnerMode;

/// Snapshot reported to the control plane on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerInfo {
    /// Runner identifier from configuration.
    pub runner_id: String,
    /// Deployment mode.
    pub mode: RunnerMode,
    /// Crate version.
    pub version: String,
    /// Provider ids this runner can launch.
    pub capabilities: Vec<String>,
    /// Sessions currently registered.
    pub active_session_count: usize,
    /// Configured capacity.
    pub max_sessions: usize,
    /// Time this snapshot was taken.
    pub last_heartbeat_at: DateTime<Utc>,
    /// Detected version per installed provider.
    pub provider_versions: BTreeMap<String, String>,
}
