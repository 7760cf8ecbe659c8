//! Boundary to the vector index.
//!
//! The ingestion core only builds, loads, inserts into and persists an index
//! through [`IndexService`]; it never looks inside. [`store::SqliteIndexService`]
//! is the implementation used by the binaries.

pub mod store;

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;

pub use store::{IndexedChunk, ScoredChunk, SqliteIndexService, VectorIndex, load_index};

/// A file's content ready for indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// File name in the watched directory.
    pub name: String,
    pub text: String,
    /// Digest of the bytes `text` was decoded from.
    pub digest: String,
}

/// Operations the orchestrator needs from an index backend.
#[async_trait]
pub trait IndexService: Send + Sync {
    type Index: Send + Sync;

    /// Create a fresh index holding exactly `docs`.
    async fn build(&self, docs: Vec<Document>) -> Result<Self::Index>;

    /// Open the persisted index.
    async fn load(&self) -> Result<Self::Index>;

    /// Add `docs` to `index`, replacing earlier versions of the same files.
    async fn insert(&self, index: &mut Self::Index, docs: Vec<Document>) -> Result<()>;

    /// Make every change to `index` durable.
    async fn persist(&self, index: &mut Self::Index) -> Result<()>;
}

/// Infix of the temporary files a rebuild writes before renaming into place.
pub(crate) const BUILDING_MARKER: &str = ".building-";

/// Whether the storage directory exists and holds anything besides
/// unfinished rebuild files.
pub fn storage_initialized(dir: &Path) -> Result<bool> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        if !entry?.file_name().to_string_lossy().contains(BUILDING_MARKER) {
            return Ok(true);
        }
    }
    Ok(false)
}
