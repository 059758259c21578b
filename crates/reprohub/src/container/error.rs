//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur while driving the container engine.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command exited unsuccessfully.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// A launch parameter was rejected before reaching the engine.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Spawning the engine binary failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
