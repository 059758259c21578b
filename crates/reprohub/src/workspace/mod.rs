//! Per-user workspace directories on the shared notebooks folder.
//!
//! Layout: `{local_root}/{dir_prefix}{escaped_name}/{artifact_id}/{repo}`.
//! The per-user directory is the workspace root and is bind-mounted into the
//! user's container; each artifact gets its own subtree below it.

mod error;
mod ownership;

pub use error::{WorkspaceError, WorkspaceResult};
pub use ownership::{ChownCommand, Ownership, OwnershipFixer};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::config::WorkspaceConfig;
use crate::session::UserIdentity;
use crate::validate::{validate_artifact_id, validate_escaped_name};

/// Owns the per-user directory tree.
pub struct WorkspaceManager {
    local_root: PathBuf,
    dir_prefix: String,
    owner: Ownership,
    fixer: Arc<dyn OwnershipFixer>,
    /// One mutex per (escaped user name, artifact id).
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl WorkspaceManager {
    pub fn new(config: &WorkspaceConfig, fixer: Arc<dyn OwnershipFixer>) -> Self {
        Self {
            local_root: config.local_root.clone(),
            dir_prefix: config.dir_prefix.clone(),
            owner: Ownership::new(config.owner_uid, config.owner_gid),
            fixer,
            locks: DashMap::new(),
        }
    }

    pub fn owner(&self) -> Ownership {
        self.owner
    }

    /// Name of the user's directory, relative to the shared root.
    pub fn dir_name(&self, identity: &UserIdentity) -> WorkspaceResult<String> {
        validate_escaped_name(&identity.escaped_name).map_err(WorkspaceError::InvalidName)?;
        Ok(format!("{}{}", self.dir_prefix, identity.escaped_name))
    }

    /// The user's workspace root as seen by this process.
    pub fn root_for(&self, identity: &UserIdentity) -> WorkspaceResult<PathBuf> {
        Ok(self.local_root.join(self.dir_name(identity)?))
    }

    /// Directory holding everything materialized for one artifact.
    pub fn artifact_dir(
        &self,
        identity: &UserIdentity,
        artifact_id: &str,
    ) -> WorkspaceResult<PathBuf> {
        validate_artifact_id(artifact_id).map_err(WorkspaceError::InvalidName)?;
        Ok(self.root_for(identity)?.join(artifact_id))
    }

    /// Acquire the mutual-exclusion scope for one (user, artifact) pair.
    ///
    /// Different pairs never contend. The guard is not reentrant.
    pub async fn lock(&self, identity: &UserIdentity, artifact_id: &str) -> OwnedMutexGuard<()> {
        let key = (identity.escaped_name.clone(), artifact_id.to_string());
        let mutex = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Create the workspace root if missing and (re)apply ownership.
    ///
    /// Ownership is fixed on every call, including when the directory
    /// already existed.
    pub async fn ensure_root(&self, identity: &UserIdentity) -> WorkspaceResult<PathBuf> {
        let root = self.root_for(identity)?;

        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => {
                debug!("Workspace root {:?} already exists", root);
            }
            Ok(_) => {
                return Err(WorkspaceError::io(
                    "use",
                    &root,
                    std::io::Error::other("path exists and is not a directory"),
                ));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Creating workspace root {:?}", root);
                tokio::fs::create_dir_all(&root)
                    .await
                    .map_err(|e| WorkspaceError::io("create", &root, e))?;
            }
            Err(e) => return Err(WorkspaceError::io("inspect", &root, e)),
        }

        self.fix_ownership(&root).await?;
        Ok(root)
    }

    /// Apply the workspace owner to a tree.
    pub async fn fix_ownership(&self, path: &Path) -> WorkspaceResult<()> {
        debug!("Setting ownership of {:?} to {}", path, self.owner);
        self.fixer.chown_recursive(path, self.owner).await
    }

    /// Remove one artifact's subtree from the user's workspace.
    ///
    /// Returns `false` when there was nothing to remove. Sibling artifacts
    /// are untouched.
    pub async fn reclaim(&self, identity: &UserIdentity, artifact_id: &str) -> WorkspaceResult<bool> {
        let dir = self.artifact_dir(identity, artifact_id)?;
        let guard = self.lock(identity, artifact_id).await;
        let removed = Self::remove_artifact_dir(&dir).await;
        drop(guard);

        // Nobody else holds or waits on the pair's mutex once only the map refers to it.
        let key = (identity.escaped_name.clone(), artifact_id.to_string());
        self.locks
            .remove_if(&key, |_, mutex| Arc::strong_count(mutex) == 1);
        removed
    }

    async fn remove_artifact_dir(dir: &Path) -> WorkspaceResult<bool> {
        match tokio::fs::symlink_metadata(dir).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Nothing to reclaim at {:?}", dir);
                return Ok(false);
            }
            Err(e) => return Err(WorkspaceError::io("inspect", dir, e)),
        }

        tokio::fs::remove_dir_all(dir)
            .await
            .map_err(|e| WorkspaceError::io("remove", dir, e))?;
        info!("Reclaimed {:?}", dir);
        Ok(true)
    }
}
