//! Optional collaborators that feed file-touch and diff hints into a
//! session as provider events.

pub mod diff_summary;
pub mod file_watcher;

pub use diff_summary::{summarize, DiffStats};
pub use file_watcher::WorkspaceWatcher;
