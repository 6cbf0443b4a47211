//! Per-session usage accounting.

use std::collections::HashSet;
use std::time::Instant;

use crate::models::event::UsageMetrics;
use crate::models::session::BillingLimits;

/// Accumulates usage for one session.
///
/// Agent time accrues only while the clock runs, which the session manager
/// ties to the `RUNNING` state. Metrics collect into an open interval that
/// [`UsageAccumulator::take_interval`] closes and folds into the total.
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    total: UsageMetrics,
    interval: UsageMetrics,
    running_since: Option<Instant>,
    files_seen: HashSet<String>,
}

impl UsageAccumulator {
    /// Start the agent-time clock. No-op if already running.
    pub fn start_clock(&mut self, now: Instant) {
        self.running_since.get_or_insert(now);
    }

    /// Stop the clock and bank the elapsed time.
    pub fn stop_clock(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.interval.agent_seconds += now.saturating_duration_since(since).as_secs_f64();
        }
    }

    /// Record provider output.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_output(&mut self, bytes: usize) {
        self.interval.terminal_kb += bytes as f64 / 1024.0;
    }

    /// Record a touched file; only the first touch of a path counts.
    pub fn record_file(&mut self, path: &str) {
        if self.files_seen.insert(path.to_owned()) {
            self.interval.files_touched += 1;
        }
    }

    /// Record a command run by the provider.
    pub fn record_command(&mut self) {
        self.interval.commands_run += 1;
    }

    /// Record an approval request.
    pub fn record_approval(&mut self) {
        self.interval.approvals_requested += 1;
    }

    /// Close the current interval and return its metrics.
    pub fn take_interval(&mut self, now: Instant) -> UsageMetrics {
        if let Some(since) = self.running_since {
            self.interval.agent_seconds += now.saturating_duration_since(since).as_secs_f64();
            self.running_since = Some(now);
        }
        let interval = std::mem::take(&mut self.interval);
        self.total += interval;
        interval
    }

    /// Everything recorded so far, including the open interval.
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> UsageMetrics {
        let mut usage = self.total;
        usage += self.interval;
        if let Some(since) = self.running_since {
            usage.agent_seconds += now.saturating_duration_since(since).as_secs_f64();
        }
        usage
    }

    /// Totals of closed intervals.
    #[must_use]
    pub fn total(&self) -> UsageMetrics {
        self.total
    }

    /// Describe the first exceeded limit, checked against closed intervals.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn exceeded(&self, limits: &BillingLimits) -> Option<String> {
        if let Some(max) = limits.max_agent_seconds {
            if self.total.agent_seconds > max as f64 {
                return Some(format!(
                    "agent seconds {:.0} > {max}",
                    self.total.agent_seconds
                ));
            }
        }
        if let Some(max) = limits.max_terminal_kb {
            if self.total.terminal_kb > max as f64 {
                return Some(format!("terminal KB {:.1} > {max}", self.total.terminal_kb));
            }
        }
        None
    }
}
