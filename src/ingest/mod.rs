pub mod walker;
pub mod hasher;
pub mod manifest;
pub mod incremental;
pub mod loader;
pub mod chunker;
pub mod lock;
pub mod orchestrator;

pub use walker::{FileMetadata, discover_files};
pub use hasher::compute_file_hash;
pub use manifest::{Manifest, ManifestStore};
pub use incremental::{FileClassification, HashedFile, classify_files, hash_files};
pub use loader::{load_document, load_documents};
pub use chunker::chunk_text;
pub use lock::IngestLock;
pub use orchestrator::{IngestOutcome, Ingestor};
