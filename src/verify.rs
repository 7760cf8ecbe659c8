//! Read-only inspection of the storage directory, index and manifest.

use std::path::PathBuf;

use crate::config::Config;
use crate::error::{Result, ShakerError};
use crate::index::{load_index, storage_initialized};
use crate::ingest::ManifestStore;

const PREVIEW_DOCUMENTS: usize = 5;
const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone)]
pub struct StorageFile {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct DocumentSummary {
    pub file_name: String,
    pub digest: String,
    pub chunk_count: usize,
    pub preview: String,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub storage_dir: PathBuf,
    pub storage_files: Vec<StorageFile>,
    pub embedding_model: String,
    pub document_count: usize,
    pub chunk_count: usize,
    /// The first few documents by file name
    pub documents: Vec<DocumentSummary>,
    pub manifest_entries: usize,
    /// In the manifest but absent from the index
    pub not_indexed: Vec<String>,
    /// In the index but absent from the manifest
    pub unrecorded: Vec<String>,
    /// Indexed under a different digest than the manifest records
    pub digest_mismatches: Vec<String>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.not_indexed.is_empty() && self.unrecorded.is_empty() && self.digest_mismatches.is_empty()
    }

    /// Write the report through the logger.
    pub fn log(&self) {
        log::info!("Storage directory: {}", self.storage_dir.display());
        for file in &self.storage_files {
            log::info!("  {} ({} bytes)", file.name, file.size);
        }
        log::info!(
            "Index: {} documents, {} chunks, embedded with {}",
            self.document_count,
            self.chunk_count,
            self.embedding_model
        );
        for doc in &self.documents {
            log::info!("  {} [{} chunks] {}", doc.file_name, doc.chunk_count, doc.preview);
        }
        if self.document_count > self.documents.len() {
            log::info!("  ... and {} more", self.document_count - self.documents.len());
        }
        log::info!("Manifest: {} entries", self.manifest_entries);

        for name in &self.not_indexed {
            log::warn!("{} is in the manifest but not in the index", name);
        }
        for name in &self.unrecorded {
            log::warn!("{} is indexed but not recorded in the manifest", name);
        }
        for name in &self.digest_mismatches {
            log::warn!("{} was indexed from different content than the manifest records", name);
        }
        if self.is_consistent() {
            log::info!("Index and manifest agree");
        }
    }
}

/// Inspect persisted storage without modifying anything.
pub async fn verify_index(config: &Config) -> Result<VerifyReport> {
    let storage_dir = config.storage_dir().to_path_buf();
    if !storage_initialized(&storage_dir)? {
        return Err(ShakerError::IndexNotFound(storage_dir));
    }

    let mut storage_files = Vec::new();
    for entry in std::fs::read_dir(&storage_dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            storage_files.push(StorageFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
            });
        }
    }
    storage_files.sort_by(|a, b| a.name.cmp(&b.name));

    let index = load_index(&config.index_path(), None).await?;
    let manifest = ManifestStore::new(config.manifest_path()).load()?;

    let documents = index
        .documents()
        .take(PREVIEW_DOCUMENTS)
        .map(|doc| DocumentSummary {
            file_name: doc.file_name.clone(),
            digest: doc.digest.clone(),
            chunk_count: index.chunks().iter().filter(|c| c.file_name == doc.file_name).count(),
            preview: preview(&doc.text),
        })
        .collect();

    let not_indexed = manifest
        .iter()
        .filter(|(name, _)| index.document(name).is_none())
        .map(|(name, _)| name.to_string())
        .collect();
    let unrecorded = index
        .documents()
        .filter(|doc| !manifest.contains(&doc.file_name))
        .map(|doc| doc.file_name.clone())
        .collect();
    let digest_mismatches = index
        .documents()
        .filter(|doc| matches!(manifest.get(&doc.file_name), Some(digest) if digest != doc.digest))
        .map(|doc| doc.file_name.clone())
        .collect();

    Ok(VerifyReport {
        storage_dir,
        storage_files,
        embedding_model: index.embedding_model().to_string(),
        document_count: index.document_count(),
        chunk_count: index.chunk_count(),
        documents,
        manifest_entries: manifest.len(),
        not_indexed,
        unrecorded,
        digest_mismatches,
    })
}

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", cut)
    }
}
