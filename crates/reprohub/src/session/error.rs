//! Session start/stop error types.

use thiserror::Error;

use crate::artifacts::ArtifactError;
use crate::auth::AuthError;
use crate::container::ContainerError;
use crate::materializer::MaterializeError;
use crate::workspace::WorkspaceError;

/// Result type for session operations.
pub type SpawnResult<T> = Result<T, SpawnError>;

/// Why a session could not be started.
///
/// Every variant raised before the container exists means no container was
/// created.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The registry has no such artifact.
    #[error("unknown artifact: {0}")]
    UnknownArtifact(String),

    /// The `artifact` option was not supplied.
    #[error("no artifact selected")]
    MissingArtifact,

    /// A recognized option has an unusable value.
    #[error("invalid option '{key}': {message}")]
    InvalidOption { key: String, message: String },

    /// The identity provider could not answer; admin is never assumed.
    #[error("authorization failed: {0}")]
    AuthorizationFailure(#[source] AuthError),

    /// The artifact could not be checked out.
    #[error("materialization failed: {0}")]
    MaterializationFailure(#[source] MaterializeError),

    /// Creating, chowning or removing workspace directories failed.
    #[error("workspace error: {0}")]
    WorkspaceError(#[source] WorkspaceError),

    /// The container engine refused to start the session.
    #[error("container error: {0}")]
    Container(#[from] ContainerError),

    /// The user already has a running session.
    #[error("user {0} already has a running session")]
    AlreadyRunning(String),

    /// Another start or stop for the user has not finished yet.
    #[error("a session start or stop for {0} is in progress")]
    InProgress(String),
}

impl SpawnError {
    /// Text shown to the user on the spawn page.
    pub fn user_message(&self) -> String {
        match self {
            SpawnError::UnknownArtifact(id) => {
                format!("The artifact '{}' is not available on this hub.", id)
            }
            SpawnError::MissingArtifact => {
                "No artifact was selected. Open the session from an artifact link.".to_string()
            }
            SpawnError::InvalidOption { key, message } => {
                format!("Invalid value for '{}': {}", key, message)
            }
            SpawnError::AuthorizationFailure(AuthError::InvalidCredential) => {
                "Your login has expired. Please log out and log in again.".to_string()
            }
            SpawnError::AuthorizationFailure(AuthError::RateLimited { .. }) => {
                "Organization membership could not be checked right now (rate limited). \
                 Please try again in a few minutes."
                    .to_string()
            }
            SpawnError::AuthorizationFailure(_) => {
                "Organization membership could not be checked. Please try again later."
                    .to_string()
            }
            SpawnError::MaterializationFailure(e) => {
                format!("The artifact repository could not be fetched: {}", e)
            }
            SpawnError::WorkspaceError(_) => {
                "Your workspace could not be prepared. Please contact an administrator."
                    .to_string()
            }
            SpawnError::Container(_) => "The session container could not be started.".to_string(),
            SpawnError::AlreadyRunning(_) => {
                "You already have a running session. Stop it before starting another one."
                    .to_string()
            }
            SpawnError::InProgress(_) => {
                "Your session is still starting or stopping. Please try again in a moment."
                    .to_string()
            }
        }
    }
}

impl From<AuthError> for SpawnError {
    fn from(err: AuthError) -> Self {
        SpawnError::AuthorizationFailure(err)
    }
}

impl From<WorkspaceError> for SpawnError {
    fn from(err: WorkspaceError) -> Self {
        SpawnError::WorkspaceError(err)
    }
}

impl From<MaterializeError> for SpawnError {
    fn from(err: MaterializeError) -> Self {
        match err {
            MaterializeError::Artifact(ArtifactError::Unknown(id)) => {
                SpawnError::UnknownArtifact(id)
            }
            MaterializeError::Artifact(ArtifactError::InvalidId(message)) => {
                SpawnError::InvalidOption {
                    key: "artifact".to_string(),
                    message,
                }
            }
            MaterializeError::Workspace(e) => SpawnError::WorkspaceError(e),
            other => SpawnError::MaterializationFailure(other),
        }
    }
}
