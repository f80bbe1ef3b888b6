//! Staging area: disposable workspaces holding one script each
//!
//! A `Workspace` owns its directory through `tempfile::TempDir`, so the
//! directory is removed when the workspace is dropped on any exit path.
//! `release` exists for the normal path where we want the deletion logged and
//! its failure visible rather than swallowed in a destructor.

use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::errors::{ExecError, Result};

/// Disposable directory holding exactly one script for one execution.
#[derive(Debug)]
pub struct Workspace {
    pub id: Uuid,
    dir: TempDir,
    script_name: String,
}

impl Workspace {
    /// Directory root, bind-mounted into the container.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// File name of the staged script within the workspace.
    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    /// Absolute path of the staged script on the host.
    pub fn script_path(&self) -> PathBuf {
        self.dir.path().join(&self.script_name)
    }
}

/// Creates and destroys workspaces under a common parent directory.
pub struct StagingArea {
    parent: Option<PathBuf>,
}

impl StagingArea {
    /// Stage under the system temp directory.
    pub fn new() -> Self {
        Self { parent: None }
    }

    /// Stage under a specific parent directory (tests, dedicated volumes).
    pub fn in_dir(parent: impl Into<PathBuf>) -> Self {
        Self {
            parent: Some(parent.into()),
        }
    }

    /// Materialize script bytes into a fresh workspace.
    ///
    /// The directory is uniquely named and readable only by the service user;
    /// the script file name is derived from the object key's basename.
    pub async fn stage(&self, key: &str, content: &[u8]) -> Result<Workspace> {
        let id = Uuid::new_v4();
        let mut builder = Builder::new();
        builder.prefix("execd-ws-");
        let dir = match &self.parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|e| ExecError::staging(format!("workspace creation failed: {}", e)))?;

        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir.path(), Permissions::from_mode(0o700))
                .map_err(|e| ExecError::staging(format!("workspace permissions failed: {}", e)))?;
        }

        let script_name = script_file_name(key);
        let script_path = dir.path().join(&script_name);
        let mut file = tokio::fs::File::create(&script_path)
            .await
            .map_err(|e| ExecError::staging(format!("script write failed: {}", e)))?;
        file.write_all(content)
            .await
            .map_err(|e| ExecError::staging(format!("script write failed: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| ExecError::staging(format!("script write failed: {}", e)))?;

        log::debug!("staged workspace {} for key {}", id, key);
        Ok(Workspace {
            id,
            dir,
            script_name,
        })
    }

    /// Recursively delete a workspace.
    ///
    /// Dropping the workspace would delete it too; going through `release`
    /// surfaces deletion failures in the log instead of discarding them.
    pub fn release(&self, workspace: Workspace) {
        let id = workspace.id;
        match workspace.dir.close() {
            Ok(()) => log::debug!("released workspace {}", id),
            Err(e) => log::error!("failed to remove workspace {}: {}", id, e),
        }
    }
}

impl Default for StagingArea {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive a safe file name from an object key.
///
/// Keys may contain prefixes ("jobs/2024/run.py"); only the basename is used,
/// and anything path-like or hidden collapses to "script".
fn script_file_name(key: &str) -> String {
    let base = key.rsplit('/').next().unwrap_or(key);
    let safe: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    if safe.is_empty() || safe.starts_with('.') {
        "script".to_string()
    } else {
        safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stage_writes_the_script_into_a_fresh_directory() {
        let staging = StagingArea::new();
        let ws = staging.stage("jobs/hello.py", b"print('hi')").await.unwrap();
        assert_eq!(ws.script_name(), "hello.py");
        let content = tokio::fs::read(ws.script_path()).await.unwrap();
        assert_eq!(content, b"print('hi')");
        staging.release(ws);
    }

    #[tokio::test]
    async fn release_removes_the_directory() {
        let staging = StagingArea::new();
        let ws = staging.stage("run.sh", b"echo hi").await.unwrap();
        let root = ws.root().to_path_buf();
        assert!(root.exists());
        staging.release(ws);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn drop_also_removes_the_directory() {
        let staging = StagingArea::new();
        let root;
        {
            let ws = staging.stage("run.py", b"pass").await.unwrap();
            root = ws.root().to_path_buf();
            assert!(root.exists());
        }
        assert!(!root.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn workspace_is_private_to_the_service_user() {
        use std::os::unix::fs::PermissionsExt;
        let staging = StagingArea::new();
        let ws = staging.stage("run.py", b"pass").await.unwrap();
        let mode = tokio::fs::metadata(ws.root()).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        staging.release(ws);
    }

    #[test]
    fn script_names_are_sanitized() {
        assert_eq!(script_file_name("jobs/2024/run.py"), "run.py");
        assert_eq!(script_file_name("plain.py"), "plain.py");
        assert_eq!(script_file_name("weird name!.py"), "weirdname.py");
        assert_eq!(script_file_name("trailing/"), "script");
        assert_eq!(script_file_name(".hidden"), "script");
    }
}
