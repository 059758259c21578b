//! JSON-file backed artifact registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{ArtifactError, ArtifactResult};
use crate::validate::{validate_artifact_id, validate_entry_file};

/// A resolved registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRecord {
    pub id: String,
    /// Clone URL of the artifact's repository.
    pub url: String,
    /// Repository-relative notebook opened by default, if any.
    pub file: Option<String>,
}

/// Read-only lookup of artifacts by id.
#[async_trait]
pub trait ArtifactRegistry: Send + Sync {
    /// Resolve an id against the registry's current contents.
    async fn resolve(&self, id: &str) -> ArtifactResult<ArtifactRecord>;

    /// All entries, sorted by id.
    async fn list(&self) -> ArtifactResult<Vec<ArtifactRecord>>;
}

/// One value in the registry file.
///
/// Older registry files map ids straight to a URL; newer ones use an object
/// with an optional `file`. Both stay valid.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegistryEntry {
    Url(String),
    Record {
        url: String,
        #[serde(default)]
        file: Option<String>,
    },
}

impl RegistryEntry {
    fn into_record(self, id: &str) -> ArtifactResult<ArtifactRecord> {
        let (url, file) = match self {
            RegistryEntry::Url(url) => (url, None),
            RegistryEntry::Record { url, file } => (url, file),
        };

        let url = url.trim().to_string();
        if url.is_empty() {
            return Err(ArtifactError::InvalidSource {
                id: id.to_string(),
                message: "url is empty".to_string(),
            });
        }

        // An empty "file" is treated like an absent one.
        let file = file.filter(|f| !f.trim().is_empty());
        if let Some(ref file) = file {
            validate_entry_file(file).map_err(|message| ArtifactError::InvalidSource {
                id: id.to_string(),
                message,
            })?;
        }

        Ok(ArtifactRecord {
            id: id.to_string(),
            url,
            file,
        })
    }
}

/// Registry backed by a JSON file that is re-read on every lookup, so new
/// artifacts are picked up without a restart.
#[derive(Debug, Clone)]
pub struct FileArtifactRegistry {
    path: PathBuf,
}

impl FileArtifactRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> ArtifactResult<BTreeMap<String, RegistryEntry>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ArtifactError::Io {
                path: self.path.clone(),
                source,
            })?;

        serde_json::from_str(&raw).map_err(|source| ArtifactError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

#[async_trait]
impl ArtifactRegistry for FileArtifactRegistry {
    async fn resolve(&self, id: &str) -> ArtifactResult<ArtifactRecord> {
        validate_artifact_id(id).map_err(ArtifactError::InvalidId)?;

        let mut entries = self.load().await?;
        let entry = entries
            .remove(id)
            .ok_or_else(|| ArtifactError::Unknown(id.to_string()))?;

        let record = entry.into_record(id)?;
        debug!("Resolved artifact {} -> {}", id, record.url);
        Ok(record)
    }

    async fn list(&self) -> ArtifactResult<Vec<ArtifactRecord>> {
        self.load()
            .await?
            .into_iter()
            .map(|(id, entry)| entry.into_record(&id))
            .collect()
    }
}
