use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, ShakerError};

/// Exclusive marker for a running ingestion.
///
/// Created with `create_new` next to the manifest and removed on drop. A lock
/// left behind by a crashed run must be deleted by the operator.
#[derive(Debug)]
pub struct IngestLock {
    path: PathBuf,
    _file: File,
}

impl IngestLock {
    /// Lock path for a manifest: `<manifest>.lock`.
    pub fn path_for(manifest_path: &Path) -> PathBuf {
        let mut name = manifest_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        manifest_path.with_file_name(name)
    }

    pub fn acquire(manifest_path: &Path) -> Result<Self> {
        let path = Self::path_for(manifest_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ShakerError::Locked(path));
            }
            Err(e) => return Err(ShakerError::Io(e)),
        };

        let _ = writeln!(file, "pid={} started={}", std::process::id(), chrono::Utc::now().to_rfc3339());
        log::debug!("Acquired ingest lock {}", path.display());
        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IngestLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
