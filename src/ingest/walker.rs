use walkdir::WalkDir;
use std::path::{Path, PathBuf};
use crate::error::{Result, ShakerError};

/// Metadata for a discovered file
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File name, the manifest key.
    pub name: String,
    pub absolute_path: PathBuf,
}

/// List the regular files directly inside `dir`, sorted by file name.
///
/// Sub-directories are not descended into. Hidden files (leading `.`) are
/// skipped, matching the document loader, so editor droppings never reach the
/// manifest. Names that are not valid UTF-8 cannot be manifest keys and are
/// skipped with a warning. Symlinks to files are followed. Listing errors
/// propagate.
pub fn discover_files(dir: &Path) -> Result<Vec<FileMetadata>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| ShakerError::FileRead {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf()),
            source: e.into(),
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let Some(name) = entry.file_name().to_str() else {
            log::warn!("Skipping {}: file name is not valid UTF-8", entry.path().display());
            continue;
        };
        if name.starts_with('.') {
            continue;
        }

        files.push(FileMetadata {
            name: name.to_string(),
            absolute_path: entry.path().to_path_buf(),
        });
    }

    log::debug!("Discovered {} files in {}", files.len(), dir.display());
    Ok(files)
}
