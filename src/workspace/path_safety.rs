//! Path validation for workspace directories and provider-reported paths.
//!
//! Workspaces live at `<root>/<session_id>`, so session ids must be a single
//! safe path component. Paths extracted from provider output are normalised
//! lexically and rejected when they escape the workspace.

use std::path::{Component, Path, PathBuf};

use crate::{AppError, Result};

/// Validate that `id` is usable as one directory name.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if `id` is empty, is `.`/`..`, starts
/// with `-` or contains anything other than ASCII alphanumerics, `-`, `_`
/// and `.`.
pub fn validate_component(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.starts_with('-')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(AppError::PathViolation(format!(
            "'{id}' is not a valid workspace directory name"
        )))
    }
}

/// Normalise `candidate` against `root` without touching the filesystem.
///
/// Returns the absolute path, or `AppError::PathViolation` when `..`
/// segments climb out of `root` or an absolute candidate lies elsewhere.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if the path escapes `root`.
pub fn resolve_within(root: &Path, candidate: impl AsRef<Path>) -> Result<PathBuf> {
    let candidate = candidate.as_ref();
    let base = if candidate.is_absolute() {
        PathBuf::new()
    } else {
        root.to_path_buf()
    };

    let mut normalized = base;
    for component in candidate.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(AppError::PathViolation(
                        "path attempts to escape workspace".into(),
                    ));
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                normalized.push(component.as_os_str());
            }
            Component::Normal(part) => normalized.push(part),
        }
    }

    if !normalized.starts_with(root) {
        return Err(AppError::PathViolation("path outside workspace".into()));
    }
    Ok(normalized)
}

/// Workspace-relative, `/`-separated form of a provider-reported path.
///
/// Returns `None` for paths that escape the workspace or resolve to the
/// workspace root itself.
#[must_use]
pub fn relativize(root: &Path, candidate: &str) -> Option<String> {
    let resolved = resolve_within(root, candidate).ok()?;
    let relative = resolved.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
