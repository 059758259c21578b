//! Hub configuration.
//!
//! One `HubConfig` is built when the process starts and handed to each
//! component's constructor. Nothing below reads the process environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::container::{PullPolicy, RuntimeType};

/// Configuration shared by every session component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub workspace: WorkspaceConfig,
    pub artifacts: ArtifactsConfig,
    pub auth: AuthConfig,
    pub git: GitConfig,
    pub container: ContainerSettings,
    pub sessions: SessionsConfig,
}

/// Shared notebooks folder layout and ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Where the shared folder is visible to this process.
    pub local_root: PathBuf,
    /// Where the same folder lives on the container engine's host, used for
    /// bind mounts. Defaults to `local_root`.
    pub host_root: Option<PathBuf>,
    /// Prefix for per-user directories (`{prefix}{escaped_name}`).
    pub dir_prefix: String,
    /// Owner uid applied to workspace content.
    pub owner_uid: u32,
    /// Owner gid applied to workspace content.
    pub owner_gid: u32,
    /// Binary used to change ownership.
    pub chown_binary: String,
    /// Run the ownership change through `sudo -n`.
    pub use_sudo: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            local_root: PathBuf::from("/srv/reprohub/notebooks"),
            host_root: None,
            dir_prefix: "jupyterhub-user-".to_string(),
            owner_uid: 1000,
            owner_gid: 100,
            chown_binary: "chown".to_string(),
            use_sudo: false,
        }
    }
}

impl WorkspaceConfig {
    /// Root of the shared folder as seen by the container engine.
    pub fn host_root(&self) -> &PathBuf {
        self.host_root.as_ref().unwrap_or(&self.local_root)
    }
}

/// Artifact registry location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    /// JSON file mapping artifact ids to repositories.
    pub registry_path: PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from("/etc/reprohub/artifacts.json"),
        }
    }
}

/// Identity provider and admin allow-list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// GitHub REST API base URL.
    pub api_url: String,
    /// Membership in any of these organizations grants admin.
    pub admin_organizations: Vec<String>,
    /// Per-request timeout for membership queries.
    pub request_timeout_seconds: u64,
    /// User-Agent sent to the API (GitHub rejects requests without one).
    pub user_agent: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            admin_organizations: Vec::new(),
            request_timeout_seconds: 10,
            user_agent: concat!("reprohub/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl AuthConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub binary: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: "git".to_string(),
        }
    }
}

/// How session containers are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Container runtime type (auto-detected if not set).
    pub runtime: Option<RuntimeType>,
    /// Custom path to the container runtime binary.
    pub binary: Option<String>,
    /// Session image.
    pub image: String,
    /// Network the session containers join.
    pub network: Option<String>,
    /// Mount point of the user's workspace root inside the container.
    pub mount_point: String,
    pub pull_policy: PullPolicy,
    /// Remove containers when they stop.
    pub remove: bool,
    /// Container names are `{name_prefix}{escaped_name}`.
    pub name_prefix: String,
    /// Command started in the container; startup arguments are appended.
    pub command: Vec<String>,
    /// Application class used when the older notebook interface is requested.
    pub classic_app: String,
    /// URL prefix the older interface serves notebooks under.
    pub classic_url_prefix: String,
    /// Shell command run inside the container after it starts.
    pub post_start_command: Option<String>,
    pub stop_timeout_seconds: u32,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            image: "jupyter/scipy-notebook:latest".to_string(),
            network: None,
            mount_point: "/workspace".to_string(),
            pull_policy: PullPolicy::Always,
            remove: true,
            name_prefix: "reprohub-".to_string(),
            command: vec!["start-singleuser.sh".to_string()],
            classic_app: "notebook.notebookapp.NotebookApp".to_string(),
            classic_url_prefix: "/notebooks".to_string(),
            post_start_command: Some(
                "conda env update --name base --file environment.yml".to_string(),
            ),
            stop_timeout_seconds: 10,
        }
    }
}

/// Idle culling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Sessions without activity for this long are stopped.
    pub idle_timeout_seconds: u64,
    /// How often the idle check runs.
    pub idle_check_interval_seconds: u64,
    /// Shell command run in the session's working directory that prints the
    /// time of the user's last activity (RFC 3339 or Unix seconds). Unset
    /// means only explicitly reported activity counts.
    pub activity_command: Option<String>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 3600,
            idle_check_interval_seconds: 300,
            activity_command: Some(
                "find . -type f -printf '%T@\\n' 2>/dev/null | sort -n | tail -n 1".to_string(),
            ),
        }
    }
}

impl SessionsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_seconds)
    }
}
