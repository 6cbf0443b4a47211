//! Tests for local workspace preparation and teardown.

use agent_runner::config::WorkspaceConfig;
use agent_runner::models::session::SessionConfig;
use agent_runner::workspace::{LocalWorkspaceManager, WorkspaceManager, WorkspaceStatus};
use agent_runner::AppError;

use super::test_helpers::session_config;

fn manager(root: &std::path::Path, git_binary: &str) -> LocalWorkspaceManager {
    LocalWorkspaceManager::new(&WorkspaceConfig {
        root: root.to_path_buf(),
        clone_url_template: "file:///nonexistent/{repo}".into(),
        git_binary: git_binary.into(),
    })
}

fn with_repo(session_id: &str, repo_ref: &str) -> SessionConfig {
    SessionConfig {
        repo_ref: repo_ref.into(),
        ..session_config(session_id)
    }
}

#[tokio::test]
async fn scratch_workspace_is_created_and_destroyed() {
    let root = tempfile::tempdir().expect("tempdir");
    let workspaces = manager(root.path(), "git");

    let info = workspaces
        .create_workspace(&session_config("sess-1"))
        .await
        .expect("create");
    assert_eq!(info.status, WorkspaceStatus::Ready);
    assert_eq!(info.worktree_path, root.path().join("sess-1"));
    assert!(info.worktree_path.is_dir());
    assert_eq!(
        workspaces.get_workspace("sess-1").map(|w| w.worktree_path),
        Some(root.path().join("sess-1"))
    );

    workspaces.destroy_workspace("sess-1").await.expect("destroy");
    assert!(!root.path().join("sess-1").exists());
    assert!(workspaces.get_workspace("sess-1").is_none());
}

#[tokio::test]
async fn destroying_unknown_workspace_is_a_no_op() {
    let root = tempfile::tempdir().expect("tempdir");
    let workspaces = manager(root.path(), "git");

    workspaces
        .destroy_workspace("never-created")
        .await
        .expect("no-op");
}

#[tokio::test]
async fn stale_directory_is_replaced() {
    let root = tempfile::tempdir().expect("tempdir");
    let stale = root.path().join("sess-1");
    std::fs::create_dir_all(&stale).expect("mkdir");
    std::fs::write(stale.join("leftover.txt"), "old").expect("write");

    let workspaces = manager(root.path(), "git");
    let info = workspaces
        .create_workspace(&session_config("sess-1"))
        .await
        .expect("create");

    assert_eq!(info.status, WorkspaceStatus::Ready);
    assert!(!stale.join("leftover.txt").exists());
}

#[tokio::test]
async fn unsafe_session_id_is_rejected() {
    let root = tempfile::tempdir().expect("tempdir");
    let workspaces = manager(root.path(), "git");

    for id in ["../escape", "a/b", "-rf"] {
        let err = workspaces
            .create_workspace(&session_config(id))
            .await
            .expect_err("unsafe id");
        assert!(matches!(err, AppError::PathViolation(_)), "{id}: {err}");
    }
}

#[tokio::test]
async fn invalid_repo_ref_fails_the_workspace() {
    let root = tempfile::tempdir().expect("tempdir");
    let workspaces = manager(root.path(), "git");

    let info = workspaces
        .create_workspace(&with_repo("sess-1", "--upload-pack=evil"))
        .await
        .expect("reported as failed workspace");
    assert_eq!(info.status, WorkspaceStatus::Failed);
    assert!(info.error.unwrap_or_default().contains("invalid repoRef"));
}

#[tokio::test]
async fn missing_git_binary_fails_the_workspace() {
    let root = tempfile::tempdir().expect("tempdir");
    let workspaces = manager(root.path(), "/nonexistent/bin/git");

    let info = workspaces
        .create_workspace(&with_repo("sess-1", "acme/widgets"))
        .await
        .expect("reported as failed workspace");
    assert_eq!(info.status, WorkspaceStatus::Failed);
    assert!(info.error.unwrap_or_default().contains("failed to run git"));
}
