//! Persisted record of which file contents have been ingested.
//!
//! The manifest maps each file name in the watched directory to the digest of
//! the bytes last ingested. It is a plain JSON object so it can be read and
//! repaired by hand, and it is replaced atomically on save.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, ShakerError};

/// File name -> hex digest. Sorted so saves are byte-stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(BTreeMap<String, String>);

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, digest: impl Into<String>) {
        self.0.insert(name.into(), digest.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Manifest {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Manifest(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Loads and saves the manifest at a fixed path.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the manifest; a missing file is the first-run empty manifest.
    ///
    /// A file that exists but is not a JSON object of strings is reported as
    /// `CorruptManifest` and left untouched.
    pub fn load(&self) -> Result<Manifest> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Manifest::new()),
            Err(source) => {
                return Err(ShakerError::FileRead {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_str(&text).map_err(|source| ShakerError::CorruptManifest {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the stored manifest: write a sibling temp file, fsync, rename.
    pub fn save(&self, manifest: &Manifest) -> Result<()> {
        let write_err = |source: std::io::Error| ShakerError::ManifestWrite {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let json = serde_json::to_string_pretty(manifest)
            .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

        let tmp = self.temp_path();
        let written = File::create(&tmp).and_then(|mut file| {
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|_| fs::rename(&tmp, &self.path)) {
            let _ = fs::remove_file(&tmp);
            return Err(write_err(e));
        }

        log::debug!("Saved manifest with {} entries to {}", manifest.len(), self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = ManifestStore::new(temp_dir.path().join("ingested_files.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load_reproduces_digests() {
        let temp_dir = TempDir::new().unwrap();
        let store = ManifestStore::new(temp_dir.path().join("ingested_files.json"));

        let manifest: Manifest = [("recipe1.txt", "aa11"), ("recipe2.txt", "bb22")].into_iter().collect();
        store.save(&manifest).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.get("recipe2.txt"), Some("bb22"));
        assert!(!temp_dir.path().join("ingested_files.json.tmp").exists());
    }

    #[test]
    fn test_saved_file_is_a_flat_json_object() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ingested_files.json");
        let store = ManifestStore::new(&path);
        store.save(&[("a.txt", "01")].into_iter().collect()).unwrap();

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value, serde_json::json!({"a.txt": "01"}));
    }

    #[test]
    fn test_save_overwrites_previous_content() {
        let temp_dir = TempDir::new().unwrap();
        let store = ManifestStore::new(temp_dir.path().join("m.json"));
        store.save(&[("a.txt", "01"), ("b.txt", "02")].into_iter().collect()).unwrap();
        store.save(&[("a.txt", "03")].into_iter().collect()).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("a.txt"), Some("03"));
    }

    #[test]
    fn test_save_creates_parent_dir() {
        let temp_dir = TempDir::new().unwrap();
        let store = ManifestStore::new(temp_dir.path().join("state/nested/m.json"));
        store.save(&Manifest::new()).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_corrupt_manifest_is_reported_and_preserved() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("m.json");
        fs::write(&path, "{\"a.txt\": 42}").unwrap();
        let store = ManifestStore::new(&path);

        assert!(matches!(store.load(), Err(ShakerError::CorruptManifest { .. })));
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"a.txt\": 42}");

        fs::write(&path, "not json").unwrap();
        assert!(matches!(store.load(), Err(ShakerError::CorruptManifest { .. })));

        fs::write(&path, "[\"a.txt\"]").unwrap();
        assert!(matches!(store.load(), Err(ShakerError::CorruptManifest { .. })));
    }
}
