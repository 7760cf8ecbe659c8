use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Ingestion step that was running when an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestPhase {
    BuildIndex,
    LoadIndex,
    InsertDocuments,
    PersistIndex,
    SaveManifest,
}

impl fmt::Display for IngestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestPhase::BuildIndex => "building index",
            IngestPhase::LoadIndex => "loading index",
            IngestPhase::InsertDocuments => "inserting documents",
            IngestPhase::PersistIndex => "persisting index",
            IngestPhase::SaveManifest => "saving manifest",
        };
        f.write_str(name)
    }
}

/// Main error type for Shaker
#[derive(Error, Debug)]
pub enum ShakerError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An input file could not be opened or read
    #[error("Failed to read {}: {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The manifest could not be written
    #[error("Failed to write manifest {}: {source}", .path.display())]
    ManifestWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The manifest exists but is not a file-name to digest mapping
    #[error(
        "Corrupt manifest {}: {source}. Repair or delete it by hand; it is never rebuilt automatically",
        .path.display()
    )]
    CorruptManifest {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The model daemon could not be reached
    #[error("Model service unavailable at {endpoint}: {reason}")]
    ServiceUnavailable { endpoint: String, reason: String },

    /// The model daemon answered with an error status or a malformed body
    #[error("Model service error: {0}")]
    Backend(String),

    /// Storage is present but unreadable or incompatible
    #[error("Failed to load index: {0}")]
    IndexLoad(String),

    /// Storage has never been initialized
    #[error("Index not found in {}. Run the ingest command first", .0.display())]
    IndexNotFound(PathBuf),

    /// A bounded external call did not finish in time
    #[error("Timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Another ingestion run holds the lock file
    #[error("Another ingestion run is in progress (lock file {}). Delete it if no run is active", .0.display())]
    Locked(PathBuf),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An error tagged with the ingestion step that produced it
    #[error("Ingestion failed while {phase}: {source}")]
    Phase {
        phase: IngestPhase,
        source: Box<ShakerError>,
    },
}

impl ShakerError {
    /// Tag this error with the ingestion step that produced it.
    pub fn in_phase(self, phase: IngestPhase) -> Self {
        ShakerError::Phase {
            phase,
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through phase tags.
    pub fn root(&self) -> &ShakerError {
        match self {
            ShakerError::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether retrying on a later invocation can succeed without operator repair.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.root(),
            ShakerError::ServiceUnavailable { .. } | ShakerError::Timeout { .. } | ShakerError::Locked(_)
        )
    }
}

/// Convenient Result type using ShakerError
pub type Result<T> = std::result::Result<T, ShakerError>;
