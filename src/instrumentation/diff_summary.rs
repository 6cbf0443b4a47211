//! Line-level change summaries.

use diffy::{create_patch, Line};

use crate::provider::ProviderEvent;

/// Added/removed line counts for one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffStats {
    /// Lines added.
    pub additions: u64,
    /// Lines removed.
    pub deletions: u64,
}

impl DiffStats {
    /// Count changed lines between `before` and `after`.
    #[must_use]
    pub fn between(before: &str, after: &str) -> Self {
        let patch = create_patch(before, after);
        let mut stats = Self::default();
        for hunk in patch.hunks() {
            for line in hunk.lines() {
                match line {
                    Line::Insert(_) => stats.additions += 1,
                    Line::Delete(_) => stats.deletions += 1,
                    Line::Context(_) => {}
                }
            }
        }
        stats
    }

    /// Accumulate another change.
    pub fn add(&mut self, other: Self) {
        self.additions += other.additions;
        self.deletions += other.deletions;
    }

    /// `+a -d` shorthand.
    #[must_use]
    pub fn shorthand(self) -> String {
        format!("+{} -{}", self.additions, self.deletions)
    }
}

/// Build a diff hint for a change to `path`.
#[must_use]
pub fn diff_hint(path: Option<&str>, stats: DiffStats) -> ProviderEvent {
    let summary = match path {
        Some(path) => format!("{path}: {}", stats.shorthand()),
        None => stats.shorthand(),
    };
    ProviderEvent::DiffHint {
        path: path.map(str::to_owned),
        additions: stats.additions,
        deletions: stats.deletions,
        summary,
    }
}

/// Summarise a before/after pair as a [`ProviderEvent::DiffHint`].
#[must_use]
pub fn summarize(path: Option<&str>, before: &str, after: &str) -> ProviderEvent {
    diff_hint(path, DiffStats::between(before, after))
}
