//! Artifact registry error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for registry operations.
pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// Errors that can occur while resolving artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The registry has no entry for this id.
    #[error("unknown artifact: {0}")]
    Unknown(String),

    /// The id cannot be used as a directory name.
    #[error("invalid artifact id: {0}")]
    InvalidId(String),

    /// The registry entry exists but cannot be used.
    #[error("invalid registry entry for artifact '{id}': {message}")]
    InvalidSource { id: String, message: String },

    /// The registry file could not be read.
    #[error("failed to read artifact registry {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The registry file is not valid JSON of the expected shape.
    #[error("failed to parse artifact registry {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
