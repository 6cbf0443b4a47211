//! Git-clone backed workspaces under a local root directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use tokio::process::Command;
use tracing::{info, info_span, warn, Instrument};

use crate::config::WorkspaceConfig;
use crate::models::session::SessionConfig;
use crate::workspace::path_safety::{resolve_within, validate_component};
use crate::workspace::{WorkspaceInfo, WorkspaceManager, WorkspaceStatus};
use crate::{AppError, BoxFuture, Result};

/// Workspaces at `<root>/<session_id>`.
///
/// A non-empty `repoRef` is cloned through the configured URL template
/// (optionally at a branch) and then checked out at the requested commit.
/// An empty `repoRef` yields an empty scratch directory.
pub struct LocalWorkspaceManager {
    root: PathBuf,
    clone_url_template: String,
    git_binary: String,
    workspaces: Mutex<HashMap<String, WorkspaceInfo>>,
}

impl LocalWorkspaceManager {
    /// Create a manager from workspace settings.
    #[must_use]
    pub fn new(config: &WorkspaceConfig) -> Self {
        Self {
            root: config.root.clone(),
            clone_url_template: config.clone_url_template.clone(),
            git_binary: config.git_binary.clone(),
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory holding every workspace.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn create_inner(&self, config: &SessionConfig) -> Result<WorkspaceInfo> {
        validate_component(&config.session_id)?;
        let path = resolve_within(&self.root, &config.session_id)?;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(path = %path.display(), "removing stale workspace directory");
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|err| AppError::Workspace(format!("failed to clear stale workspace: {err}")))?;
        }

        let outcome = if config.repo_ref.is_empty() {
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|err| AppError::Workspace(format!("failed to create workspace: {err}")))
        } else {
            self.clone_repo(config, &path).await
        };

        let info = match outcome {
            Ok(()) => WorkspaceInfo {
                session_id: config.session_id.clone(),
                worktree_path: path,
                status: WorkspaceStatus::Ready,
                error: None,
            },
            Err(err) => {
                warn!(%err, "workspace preparation failed");
                WorkspaceInfo {
                    session_id: config.session_id.clone(),
                    worktree_path: path,
                    status: WorkspaceStatus::Failed,
                    error: Some(err.to_string()),
                }
            }
        };

        self.workspaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.session_id.clone(), info.clone());
        Ok(info)
    }

    async fn clone_repo(&self, config: &SessionConfig, path: &Path) -> Result<()> {
        validate_ref("repoRef", &config.repo_ref)?;
        let url = self.clone_url_template.replace("{repo}", &config.repo_ref);

        let mut args = vec!["clone".to_owned(), "--quiet".to_owned()];
        if let Some(branch) = &config.checkout.branch {
            validate_ref("branch", branch)?;
            args.push("--branch".into());
            args.push(branch.clone());
        }
        args.push("--".into());
        args.push(url);
        args.push(path.to_string_lossy().into_owned());
        self.git(&self.root, &args).await?;

        if let Some(commit) = &config.checkout.commit {
            validate_ref("commit", commit)?;
            self.git(
                path,
                &["checkout".to_owned(), "--quiet".to_owned(), commit.clone()],
            )
            .await?;
        }

        info!(repo = %config.repo_ref, "repository cloned");
        Ok(())
    }

    async fn git(&self, cwd: &Path, args: &[String]) -> Result<()> {
        let output = Command::new(&self.git_binary)
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| AppError::Workspace(format!("failed to run git: {err}")))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(AppError::Workspace(format!(
                "git {} failed: {}",
                args.first().map_or("", String::as_str),
                stderr.trim()
            )))
        }
    }

    async fn destroy_inner(&self, session_id: &str) -> Result<()> {
        let known = self
            .workspaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        let Some(info) = known else {
            return Ok(());
        };

        match tokio::fs::remove_dir_all(&info.worktree_path).await {
            Ok(()) => {
                info!(path = %info.worktree_path.display(), "workspace destroyed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Workspace(format!(
                "failed to remove workspace: {err}"
            ))),
        }
    }
}

/// Reject git arguments that could be parsed as options or walk paths.
fn validate_ref(name: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && !value.starts_with('-')
        && !value.contains("..")
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if valid {
        Ok(())
    } else {
        Err(AppError::Workspace(format!("invalid {name} '{value}'")))
    }
}

impl WorkspaceManager for LocalWorkspaceManager {
    fn create_workspace<'a>(&'a self, config: &'a SessionConfig) -> BoxFuture<'a, Result<WorkspaceInfo>> {
        let span = info_span!("create_workspace", session_id = %config.session_id);
        Box::pin(self.create_inner(config).instrument(span))
    }

    fn get_workspace(&self, session_id: &str) -> Option<WorkspaceInfo> {
        self.workspaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    fn destroy_workspace<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>> {
        let span = info_span!("destroy_workspace", session_id);
        Box::pin(self.destroy_inner(session_id).instrument(span))
    }
}
