//! Workspace error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for workspace operations.
pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

/// Errors from creating, chowning or removing workspace directories.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// A name would not produce a single safe path segment.
    #[error("invalid workspace path component: {0}")]
    InvalidName(String),

    /// Filesystem operation failed.
    #[error("failed to {action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The ownership command could not be run or exited unsuccessfully.
    #[error("failed to set ownership of {path:?}: {message}")]
    Ownership { path: PathBuf, message: String },

    /// Neither root nor sudo is available to change ownership.
    #[error("changing workspace ownership to {0} requires root privileges or use_sudo = true")]
    InsufficientPrivileges(String),
}

impl WorkspaceError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}
