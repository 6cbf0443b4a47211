//! Workspace file watcher.
//!
//! Watches a session workspace recursively with `notify` and forwards
//! create/modify/remove events as [`ProviderEvent::FilesTouched`] hints.
//! Anything under `.git/` is ignored. Dropping the [`WorkspaceWatcher`]
//! stops the watch.

use std::path::{Path, PathBuf};

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn};

use crate::provider::{FileOperation, ProviderEvent};
use crate::workspace::path_safety::relativize;
use crate::{AppError, Result};

/// Active recursive watch over one workspace.
pub struct WorkspaceWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl std::fmt::Debug for WorkspaceWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceWatcher")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl WorkspaceWatcher {
    /// Start watching `root`, sending hints through `tx`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Workspace` if the watcher cannot be created or the
    /// directory cannot be watched.
    pub fn start(root: &Path, tx: mpsc::UnboundedSender<ProviderEvent>) -> Result<Self> {
        let _span = info_span!("workspace_watcher", root = %root.display()).entered();

        let base = root.to_path_buf();
        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if let Some(hint) = translate(&base, &event) {
                        if tx.send(hint).is_err() {
                            debug!("file watcher receiver closed");
                        }
                    }
                }
                Err(err) => warn!(%err, "file watcher error"),
            },
        )
        .map_err(|err| AppError::Workspace(format!("failed to create watcher: {err}")))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|err| AppError::Workspace(format!("failed to watch workspace: {err}")))?;

        info!("watching workspace for file changes");
        Ok(Self {
            _watcher: watcher,
            root: root.to_path_buf(),
        })
    }
}

/// Map a raw `notify` event to a files-touched hint.
#[must_use]
pub fn translate(root: &Path, event: &Event) -> Option<ProviderEvent> {
    let operation = match event.kind {
        EventKind::Create(_) => FileOperation::Create,
        EventKind::Modify(ModifyKind::Metadata(_)) => return None,
        EventKind::Modify(_) => FileOperation::Write,
        EventKind::Remove(_) => FileOperation::Delete,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return None,
    };

    let paths: Vec<String> = event
        .paths
        .iter()
        .filter_map(|path| relativize(root, &path.to_string_lossy()))
        .filter(|rel| rel != ".git" && !rel.starts_with(".git/"))
        .collect();

    if paths.is_empty() {
        None
    } else {
        Some(ProviderEvent::FilesTouched { paths, operation })
    }
}
