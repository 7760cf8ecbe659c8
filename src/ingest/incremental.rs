//! Incremental ingestion: classify files by comparing their digests with the manifest.
//!
//! Only new or modified files need embedding; unchanged files are skipped.

use std::collections::HashSet;

use crate::error::Result;
use crate::ingest::{compute_file_hash, FileMetadata, Manifest};

/// A discovered file together with its current digest.
#[derive(Debug, Clone)]
pub struct HashedFile {
    pub file: FileMetadata,
    pub digest: String,
}

impl HashedFile {
    pub fn name(&self) -> &str {
        &self.file.name
    }
}

/// Result of classifying discovered files against the manifest.
#[derive(Debug, Default)]
pub struct FileClassification {
    /// Files with no manifest entry.
    pub new_files: Vec<HashedFile>,
    /// Files whose digest differs from the manifest entry.
    pub modified_files: Vec<HashedFile>,
    /// Files whose digest matches the manifest entry.
    pub unchanged_files: Vec<HashedFile>,
    /// Manifest keys with no file on disk. Reported only; never removed.
    pub missing_files: Vec<String>,
}

impl FileClassification {
    /// Files that need (re-)ingestion, in directory order.
    pub fn change_set(&self) -> Vec<&HashedFile> {
        let mut set: Vec<&HashedFile> = self.new_files.iter().chain(self.modified_files.iter()).collect();
        set.sort_by(|a, b| a.file.name.cmp(&b.file.name));
        set
    }

    pub fn has_changes(&self) -> bool {
        !self.new_files.is_empty() || !self.modified_files.is_empty()
    }
}

/// Hash every file, preserving order.
pub fn hash_files(files: &[FileMetadata]) -> Result<Vec<HashedFile>> {
    files
        .iter()
        .map(|file| {
            Ok(HashedFile {
                digest: compute_file_hash(&file.absolute_path)?,
                file: file.clone(),
            })
        })
        .collect()
}

/// Classify discovered files into new, modified, or unchanged relative to the manifest.
///
/// Every file is hashed; a file that cannot be read fails the classification.
pub fn classify_files(files: &[FileMetadata], manifest: &Manifest) -> Result<FileClassification> {
    let mut classification = FileClassification::default();

    for hashed in hash_files(files)? {
        match manifest.get(hashed.name()) {
            None => classification.new_files.push(hashed),
            Some(stored) if stored != hashed.digest => classification.modified_files.push(hashed),
            Some(_) => classification.unchanged_files.push(hashed),
        }
    }

    let on_disk: HashSet<&str> = files.iter().map(|f| f.name.as_str()).collect();
    classification.missing_files = manifest
        .iter()
        .filter(|(name, _)| !on_disk.contains(name))
        .map(|(name, _)| name.to_string())
        .collect();

    Ok(classification)
}
