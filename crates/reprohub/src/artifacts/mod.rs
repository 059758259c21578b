//! Artifact registry.
//!
//! Maps short artifact ids to the git repository that gets cloned into a
//! user's workspace, plus an optional notebook opened by default.

mod error;
mod registry;

pub use error::{ArtifactError, ArtifactResult};
pub use registry::{ArtifactRecord, ArtifactRegistry, FileArtifactRegistry};
