//! Artifact checkout into a user's workspace.
//!
//! Each (user, artifact) pair is cloned at most once. An existing checkout is
//! reused as-is: upstream changes and registry URL changes have no effect
//! until the artifact's workspace is reclaimed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactError, ArtifactRecord, ArtifactRegistry};
use crate::config::GitConfig;
use crate::session::UserIdentity;
use crate::validate::validate_path_segment;
use crate::workspace::{WorkspaceError, WorkspaceManager};

/// Errors from resolving or fetching an artifact.
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// No usable directory name can be derived from the repository URL.
    #[error("cannot derive a repository name from '{url}': {message}")]
    InvalidRepoName { url: String, message: String },

    /// The clone command could not be run or exited unsuccessfully.
    #[error("git clone of {url} failed: {message}")]
    CloneFailed { url: String, message: String },
}

/// Fetches a repository, including nested submodules.
#[async_trait]
pub trait RepositoryFetcher: Send + Sync {
    /// Clone `url` into `dest`, which must not exist yet.
    async fn clone_recursive(&self, url: &str, dest: &Path) -> Result<(), MaterializeError>;
}

/// `git clone --recurse-submodules` via the git CLI.
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: String,
}

impl GitCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn from_config(config: &GitConfig) -> Self {
        Self::new(config.binary.clone())
    }
}

#[async_trait]
impl RepositoryFetcher for GitCli {
    async fn clone_recursive(&self, url: &str, dest: &Path) -> Result<(), MaterializeError> {
        debug!("Running: {} clone --recurse-submodules {} {:?}", self.binary, url, dest);

        let output = Command::new(&self.binary)
            .arg("clone")
            .arg("--recurse-submodules")
            .arg("--")
            .arg(url)
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .map_err(|e| MaterializeError::CloneFailed {
                url: url.to_string(),
                message: format!("failed to run {}: {}", self.binary, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MaterializeError::CloneFailed {
                url: url.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}

/// Derive the checkout directory name from a clone URL.
///
/// Takes the final path segment and strips one trailing `.git`:
/// `https://example.com/org/repo.git` becomes `repo`.
pub fn repo_name_from_url(url: &str) -> Result<String, MaterializeError> {
    let invalid = |message: String| MaterializeError::InvalidRepoName {
        url: url.to_string(),
        message,
    };

    let trimmed = url.trim().trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    let name = last.strip_suffix(".git").unwrap_or(last);

    validate_path_segment(name, "repository name").map_err(invalid)?;
    Ok(name.to_string())
}

/// Result of materializing an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    pub artifact: ArtifactRecord,
    pub repo_name: String,
    /// `{artifact_id}/{repo_name}`, relative to the workspace root.
    pub subpath: String,
    /// Checkout location as seen by this process.
    pub local_path: PathBuf,
    /// Whether this call performed the clone.
    pub cloned: bool,
}

impl Materialized {
    pub fn entry_file(&self) -> Option<&str> {
        self.artifact.file.as_deref()
    }
}

/// Resolves artifacts and checks them out into user workspaces.
pub struct ArtifactMaterializer {
    registry: Arc<dyn ArtifactRegistry>,
    workspaces: Arc<WorkspaceManager>,
    fetcher: Arc<dyn RepositoryFetcher>,
}

impl ArtifactMaterializer {
    pub fn new(
        registry: Arc<dyn ArtifactRegistry>,
        workspaces: Arc<WorkspaceManager>,
        fetcher: Arc<dyn RepositoryFetcher>,
    ) -> Self {
        Self {
            registry,
            workspaces,
            fetcher,
        }
    }

    /// Ensure `{root}/{artifact_id}/{repo}` holds a checkout of the artifact.
    ///
    /// Resolution happens before any filesystem mutation. The clone is staged
    /// in a hidden sibling directory and renamed into place only once it
    /// succeeded, so the target exists only for complete checkouts.
    pub async fn materialize(
        &self,
        identity: &UserIdentity,
        artifact_id: &str,
    ) -> Result<Materialized, MaterializeError> {
        let record = self.registry.resolve(artifact_id).await?;
        let repo_name = repo_name_from_url(&record.url)?;
        let artifact_dir = self.workspaces.artifact_dir(identity, artifact_id)?;
        let target = artifact_dir.join(&repo_name);

        let _guard = self.workspaces.lock(identity, artifact_id).await;

        let cloned = if path_exists(&target).await? {
            debug!("Reusing existing checkout {:?}", target);
            false
        } else {
            self.clone_into(&record.url, &artifact_dir, &repo_name, &target)
                .await?;
            self.workspaces.fix_ownership(&artifact_dir).await?;
            info!(
                "Materialized artifact {} for {} at {:?}",
                artifact_id, identity.login, target
            );
            true
        };

        Ok(Materialized {
            subpath: format!("{}/{}", artifact_id, repo_name),
            artifact: record,
            repo_name,
            local_path: target,
            cloned,
        })
    }

    async fn clone_into(
        &self,
        url: &str,
        artifact_dir: &Path,
        repo_name: &str,
        target: &Path,
    ) -> Result<(), MaterializeError> {
        tokio::fs::create_dir_all(artifact_dir)
            .await
            .map_err(|e| WorkspaceError::io("create", artifact_dir, e))?;

        let staging = artifact_dir.join(format!(".{}.clone-{}", repo_name, uuid::Uuid::new_v4()));
        info!("Cloning {} into {:?}", url, target);

        if let Err(e) = self.fetcher.clone_recursive(url, &staging).await {
            discard_staging(&staging, artifact_dir).await;
            return Err(e);
        }

        if let Err(e) = tokio::fs::rename(&staging, target).await {
            discard_staging(&staging, artifact_dir).await;
            return Err(WorkspaceError::io("move checkout into", target, e).into());
        }

        Ok(())
    }
}

async fn path_exists(path: &Path) -> Result<bool, WorkspaceError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(WorkspaceError::io("inspect", path, e)),
    }
}

/// Remove a failed clone, and the artifact directory if nothing else is in it.
async fn discard_staging(staging: &Path, artifact_dir: &Path) {
    match tokio::fs::remove_dir_all(staging).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!("Failed to remove partial clone {:?}: {}", staging, e);
            return;
        }
    }

    // Fails harmlessly when other checkouts live there.
    if tokio::fs::remove_dir(artifact_dir).await.is_ok() {
        debug!("Removed empty artifact directory {:?}", artifact_dir);
    }
}
