//! Ownership of workspace content.
//!
//! Session content is owned by a fixed unprivileged uid/gid, never by the
//! hub's own identity.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::error::{WorkspaceError, WorkspaceResult};
use crate::config::WorkspaceConfig;

/// Numeric owner applied to workspace directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Ownership {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

impl std::fmt::Display for Ownership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

/// Recursively assigns ownership to a directory tree.
#[async_trait]
pub trait OwnershipFixer: Send + Sync {
    async fn chown_recursive(&self, path: &Path, owner: Ownership) -> WorkspaceResult<()>;
}

/// Runs `chown -R uid:gid path`, optionally through `sudo -n`.
#[derive(Debug, Clone)]
pub struct ChownCommand {
    binary: String,
    use_sudo: bool,
}

impl ChownCommand {
    pub fn new(binary: impl Into<String>, use_sudo: bool) -> Self {
        Self {
            binary: binary.into(),
            use_sudo,
        }
    }

    pub fn from_config(config: &WorkspaceConfig) -> Self {
        Self::new(config.chown_binary.clone(), config.use_sudo)
    }

    /// Check whether ownership changes to `owner` can succeed.
    pub fn check_privileges(&self, owner: Ownership) -> WorkspaceResult<()> {
        let euid = unsafe { libc::geteuid() };

        if euid == 0 {
            debug!("Running as root, workspace ownership changes available");
            return Ok(());
        }

        if self.use_sudo {
            // Operation-time errors will surface a missing sudo rule.
            debug!("Workspace ownership changes will use sudo -n {}", self.binary);
            return Ok(());
        }

        if euid == owner.uid {
            return Ok(());
        }

        Err(WorkspaceError::InsufficientPrivileges(owner.to_string()))
    }
}

#[async_trait]
impl OwnershipFixer for ChownCommand {
    async fn chown_recursive(&self, path: &Path, owner: Ownership) -> WorkspaceResult<()> {
        let is_root = unsafe { libc::geteuid() } == 0;
        let owner_arg = owner.to_string();

        let mut command = if self.use_sudo && !is_root {
            let mut command = Command::new("sudo");
            command.arg("-n").arg(&self.binary);
            command
        } else {
            Command::new(&self.binary)
        };
        command.arg("-R").arg(&owner_arg).arg(path);

        debug!("Running: {} -R {} {:?}", self.binary, owner_arg, path);
        let output = command
            .output()
            .await
            .map_err(|e| WorkspaceError::Ownership {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkspaceError::Ownership {
                path: path.to_path_buf(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}
