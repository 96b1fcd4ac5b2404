//! Workspace path resolution policy.
//!
//! The content service works on absolute paths inside the per-project
//! volume. Session workspace routes accept relative paths (joined under
//! the session's workspace base) or absolute paths that stay inside it.

/// Base directory of a session's workspace on the content volume.
pub fn session_workspace_base(session: &str) -> String {
    format!("/sessions/{session}/workspace")
}

/// Resolve a caller-supplied workspace path for a session.
///
/// Relative paths join under the workspace base. Absolute paths are
/// accepted only when they equal the base or are a descendant of it.
/// Traversal segments are rejected in both forms.
pub fn resolve_workspace_path(session: &str, path: &str) -> Result<String, String> {
    if path.split('/').any(|seg| seg == "..") {
        return Err("path must not contain traversal segments".to_string());
    }
    let base = session_workspace_base(session);
    if let Some(absolute) = path.strip_prefix('/') {
        let full = format!("/{}", absolute.trim_end_matches('/'));
        if full == base || full.starts_with(&format!("{base}/")) {
            return Ok(full);
        }
        return Err(format!("absolute path must stay under {base}"));
    }
    let trimmed = path.trim_start_matches("./").trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(base);
    }
    Ok(format!("{base}/{trimmed}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_join_under_base() {
        assert_eq!(
            resolve_workspace_path("s1", "src/main.rs").unwrap(),
            "/sessions/s1/workspace/src/main.rs"
        );
        assert_eq!(
            resolve_workspace_path("s1", "./notes.md").unwrap(),
            "/sessions/s1/workspace/notes.md"
        );
        assert_eq!(
            resolve_workspace_path("s1", "").unwrap(),
            "/sessions/s1/workspace"
        );
    }

    #[test]
    fn absolute_base_and_descendants_pass() {
        assert_eq!(
            resolve_workspace_path("s1", "/sessions/s1/workspace").unwrap(),
            "/sessions/s1/workspace"
        );
        assert_eq!(
            resolve_workspace_path("s1", "/sessions/s1/workspace/a/b").unwrap(),
            "/sessions/s1/workspace/a/b"
        );
    }

    #[test]
    fn foreign_absolute_paths_fail() {
        assert!(resolve_workspace_path("s1", "/sessions/s2/workspace/x").is_err());
        assert!(resolve_workspace_path("s1", "/etc/passwd").is_err());
        // Prefix of the base that is not the base itself.
        assert!(resolve_workspace_path("s1", "/sessions/s1/workspace-evil/x").is_err());
    }

    #[test]
    fn traversal_is_rejected_everywhere() {
        assert!(resolve_workspace_path("s1", "../escape").is_err());
        assert!(resolve_workspace_path("s1", "a/../../b").is_err());
        assert!(resolve_workspace_path("s1", "/sessions/s1/workspace/../x").is_err());
    }
}
