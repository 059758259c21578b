//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::AuthResult;

/// Who a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Login name at the identity provider.
    pub login: String,
    /// Filesystem-safe form of the name, as escaped by the hub front-end.
    pub escaped_name: String,
}

impl UserIdentity {
    pub fn new(login: impl Into<String>, escaped_name: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            escaped_name: escaped_name.into(),
        }
    }
}

/// Notebook interface served in the session container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interface {
    /// JupyterLab.
    #[default]
    Lab,
    /// The older notebook interface.
    Classic,
}

impl Interface {
    /// Interpret the `lab` option value.
    pub fn from_lab_flag(value: &str) -> Result<Self, String> {
        match value.trim().to_lowercase().as_str() {
            "" | "1" | "true" | "yes" | "on" => Ok(Interface::Lab),
            "0" | "false" | "no" | "off" => Ok(Interface::Classic),
            other => Err(format!(
                "lab must be one of 1/0, true/false, yes/no, on/off (got '{}')",
                other
            )),
        }
    }
}

impl std::fmt::Display for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interface::Lab => write!(f, "lab"),
            Interface::Classic => write!(f, "classic"),
        }
    }
}

/// Validated options supplied at spawn time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    pub artifact: Option<String>,
    pub interface: Interface,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Start request received.
    Requested,
    /// Checking organization membership.
    Authorizing,
    /// Preparing the workspace and artifact checkout.
    Provisioning,
    /// Container is running.
    Running,
    /// Container is being stopped.
    Stopping,
    /// Container stopped and artifact storage reclaimed.
    Reclaimed,
    /// Start failed before a container was created.
    Aborted,
}

impl SessionState {
    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Requested, Authorizing)
                | (Authorizing, Provisioning)
                | (Authorizing, Aborted)
                | (Provisioning, Running)
                | (Provisioning, Aborted)
                | (Running, Stopping)
                | (Stopping, Reclaimed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Reclaimed | SessionState::Aborted)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Requested => write!(f, "requested"),
            SessionState::Authorizing => write!(f, "authorizing"),
            SessionState::Provisioning => write!(f, "provisioning"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Reclaimed => write!(f, "reclaimed"),
            SessionState::Aborted => write!(f, "aborted"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "requested" => Ok(SessionState::Requested),
            "authorizing" => Ok(SessionState::Authorizing),
            "provisioning" => Ok(SessionState::Provisioning),
            "running" => Ok(SessionState::Running),
            "stopping" => Ok(SessionState::Stopping),
            "reclaimed" => Ok(SessionState::Reclaimed),
            "aborted" => Ok(SessionState::Aborted),
            _ => Err(format!("unknown session state: {}", s)),
        }
    }
}

/// A running session.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    /// Unique session ID.
    pub id: String,
    pub identity: UserIdentity,
    pub options: SessionOptions,
    pub auth: AuthResult,
    pub state: SessionState,
    /// Container ID returned by the engine.
    pub container_id: String,
    /// Deterministic container name for the user.
    pub container_name: String,
    /// Host path bind-mounted as the workspace root.
    pub mount_path: String,
    /// Working directory inside the container.
    pub workdir: String,
    /// Startup arguments appended to the container command.
    pub startup_args: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn is_admin(&self) -> bool {
        self.auth.is_admin
    }
}
