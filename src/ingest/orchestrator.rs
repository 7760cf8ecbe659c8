use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::error::{IngestPhase, Result, ShakerError};
use crate::index::{storage_initialized, Document, IndexService};
use super::incremental::classify_files;
use super::loader::load_documents;
use super::lock::IngestLock;
use super::manifest::{Manifest, ManifestStore};
use super::walker::{discover_files, FileMetadata};

/// What an ingestion run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new index was built from every file.
    Indexed { files: Vec<String> },
    /// New and modified files were added to the existing index.
    Updated { files: Vec<String> },
    NoChanges,
}

/// Keeps the persisted index and the manifest in step with the watched directory.
///
/// The index is always persisted before the manifest is saved, so after any
/// failure the manifest on disk still describes what the index held before
/// the run and the next run retries the same files.
pub struct Ingestor<S: IndexService> {
    data_dir: PathBuf,
    storage_dir: PathBuf,
    store: ManifestStore,
    service: S,
    timeout: Option<Duration>,
    force: bool,
}

impl<S: IndexService> Ingestor<S> {
    pub fn new(config: &Config, store: ManifestStore, service: S) -> Self {
        Self {
            data_dir: config.data_dir().to_path_buf(),
            storage_dir: config.storage_dir().to_path_buf(),
            store,
            service,
            timeout: config.ingest_timeout(),
            force: false,
        }
    }

    /// Rebuild from every file even when storage already holds an index.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub async fn run(&self) -> Result<IngestOutcome> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.storage_dir)?;
        let _lock = IngestLock::acquire(self.store.path())?;

        let files = discover_files(&self.data_dir)?;
        if files.is_empty() {
            log::warn!("No files found in {}", self.data_dir.display());
            return Ok(IngestOutcome::NoChanges);
        }

        if self.force || !storage_initialized(&self.storage_dir)? {
            self.bootstrap(&files).await
        } else {
            self.update(&files).await
        }
    }

    /// Manifest entries whose file is gone from the watched directory.
    ///
    /// Their content stays in the index; nothing prunes it.
    pub fn missing_files(&self) -> Result<Vec<String>> {
        let manifest = self.store.load()?;
        let present = discover_files(&self.data_dir)?;
        Ok(manifest
            .iter()
            .map(|(name, _)| name)
            .filter(|name| !present.iter().any(|f| f.name == *name))
            .map(String::from)
            .collect())
    }

    async fn bootstrap(&self, files: &[FileMetadata]) -> Result<IngestOutcome> {
        if self.force {
            log::info!("Forced rebuild: indexing all {} files", files.len());
        } else {
            log::info!("No index in {}; building from {} files", self.storage_dir.display(), files.len());
        }

        let docs = load_documents(files)?;
        let manifest: Manifest = docs.iter().map(|d| (d.name.clone(), d.digest.clone())).collect();
        let names = doc_names(&docs);

        let mut index = self.call(IngestPhase::BuildIndex, self.service.build(docs)).await?;
        self.call(IngestPhase::PersistIndex, self.service.persist(&mut index)).await?;
        self.save_manifest(&manifest)?;

        log::info!("Indexed {} files", names.len());
        Ok(IngestOutcome::Indexed { files: names })
    }

    async fn update(&self, files: &[FileMetadata]) -> Result<IngestOutcome> {
        let mut manifest = self.store.load()?;
        let mut index = self.call(IngestPhase::LoadIndex, self.service.load()).await?;

        let classification = classify_files(files, &manifest)?;
        for name in &classification.missing_files {
            log::warn!("{} is in the manifest but no longer on disk; its content stays indexed", name);
        }
        if !classification.has_changes() {
            log::info!("No new or modified files ({} unchanged)", classification.unchanged_files.len());
            return Ok(IngestOutcome::NoChanges);
        }

        log::info!(
            "{} new, {} modified, {} unchanged",
            classification.new_files.len(),
            classification.modified_files.len(),
            classification.unchanged_files.len()
        );

        let docs = load_documents(classification.change_set().into_iter().map(|h| &h.file))?;
        for doc in &docs {
            manifest.insert(doc.name.clone(), doc.digest.clone());
        }
        let names = doc_names(&docs);

        self.call(IngestPhase::InsertDocuments, self.service.insert(&mut index, docs)).await?;
        self.call(IngestPhase::PersistIndex, self.service.persist(&mut index)).await?;
        self.save_manifest(&manifest)?;

        log::info!("Updated {} files", names.len());
        Ok(IngestOutcome::Updated { files: names })
    }

    /// Run one index step under the configured timeout, tagging failures with the step.
    async fn call<T, F>(&self, phase: IngestPhase, step: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, step).await {
                Ok(result) => result,
                Err(_) => Err(ShakerError::Timeout {
                    secs: limit.as_secs(),
                }),
            },
            None => step.await,
        };
        result.map_err(|e| {
            log::error!("Failed while {}: {}", phase, e);
            e.in_phase(phase)
        })
    }

    fn save_manifest(&self, manifest: &Manifest) -> Result<()> {
        self.store
            .save(manifest)
            .map_err(|e| e.in_phase(IngestPhase::SaveManifest))
    }
}

fn doc_names(docs: &[Document]) -> Vec<String> {
    docs.iter().map(|d| d.name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::store::tests::FakeEmbedder;
    use crate::index::{SqliteIndexService, VectorIndex};
    use crate::ingest::hasher::hash_bytes;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Debug, Default, Clone)]
    struct MockIndex {
        docs: BTreeMap<String, String>,
    }

    /// Records every call; `persist` writes the index as a file in storage.
    #[derive(Clone, Default)]
    struct MockService {
        storage_dir: PathBuf,
        calls: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
        hang_on: Option<&'static str>,
    }

    impl MockService {
        fn new(storage_dir: &Path) -> Self {
            Self {
                storage_dir: storage_dir.to_path_buf(),
                ..Self::default()
            }
        }

        fn failing(mut self, step: &'static str) -> Self {
            self.fail_on = Some(step);
            self
        }

        fn hanging(mut self, step: &'static str) -> Self {
            self.hang_on = Some(step);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn inserted(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| c.strip_prefix("insert:").map(String::from))
                .collect()
        }

        async fn enter(&self, step: &'static str, detail: String) -> Result<()> {
            self.calls.lock().unwrap().push(detail);
            if self.hang_on == Some(step) {
                std::future::pending::<()>().await;
            }
            if self.fail_on == Some(step) {
                return Err(ShakerError::ServiceUnavailable {
                    endpoint: "http://localhost:11434".to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(())
        }

        fn index_file(&self) -> PathBuf {
            self.storage_dir.join("mock_index.json")
        }
    }

    #[async_trait]
    impl IndexService for MockService {
        type Index = MockIndex;

        async fn build(&self, docs: Vec<Document>) -> Result<MockIndex> {
            self.enter("build", format!("build:{}", doc_names(&docs).join(","))).await?;
            Ok(MockIndex {
                docs: docs.into_iter().map(|d| (d.name, d.text)).collect(),
            })
        }

        async fn load(&self) -> Result<MockIndex> {
            self.enter("load", "load".to_string()).await?;
            let bytes = fs::read(self.index_file()).map_err(|e| ShakerError::IndexLoad(e.to_string()))?;
            let docs = serde_json::from_slice(&bytes).map_err(|e| ShakerError::IndexLoad(e.to_string()))?;
            Ok(MockIndex { docs })
        }

        async fn insert(&self, index: &mut MockIndex, docs: Vec<Document>) -> Result<()> {
            for doc in &docs {
                self.calls.lock().unwrap().push(format!("insert:{}", doc.name));
            }
            self.enter("insert", "insert-batch".to_string()).await?;
            index.docs.extend(docs.into_iter().map(|d| (d.name, d.text)));
            Ok(())
        }

        async fn persist(&self, index: &mut MockIndex) -> Result<()> {
            self.enter("persist", "persist".to_string()).await?;
            fs::create_dir_all(&self.storage_dir)?;
            fs::write(self.index_file(), serde_json::to_vec(&index.docs).unwrap())?;
            Ok(())
        }
    }

    struct Fixture {
        _temp: TempDir,
        config: Config,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let mut config = Config::default();
            config.paths.data_dir = temp.path().join("recipes");
            config.paths.storage_dir = temp.path().join("storage");
            config.paths.manifest_path = temp.path().join("ingested_files.json");
            fs::create_dir_all(&config.paths.data_dir).unwrap();
            Self { _temp: temp, config }
        }

        fn write(&self, name: &str, content: &str) {
            fs::write(self.config.data_dir().join(name), content).unwrap();
        }

        fn remove(&self, name: &str) {
            fs::remove_file(self.config.data_dir().join(name)).unwrap();
        }

        fn store(&self) -> ManifestStore {
            ManifestStore::new(self.config.manifest_path())
        }

        fn service(&self) -> MockService {
            MockService::new(self.config.storage_dir())
        }

        fn ingestor(&self, service: MockService) -> Ingestor<MockService> {
            Ingestor::new(&self.config, self.store(), service)
        }

        fn manifest_bytes(&self) -> Option<Vec<u8>> {
            fs::read(self.config.manifest_path()).ok()
        }
    }

    #[tokio::test]
    async fn test_bootstrap_indexes_everything_and_writes_manifest() {
        let fx = Fixture::new();
        fx.write("recipe1.txt", "Margarita: tequila, lime, triple sec");
        fx.write("recipe2.txt", "Daiquiri: rum, lime, sugar");
        let svc = fx.service();

        let outcome = fx.ingestor(svc.clone()).run().await.unwrap();

        assert_eq!(
            outcome,
            IngestOutcome::Indexed {
                files: vec!["recipe1.txt".to_string(), "recipe2.txt".to_string()]
            }
        );
        assert_eq!(svc.calls(), vec!["build:recipe1.txt,recipe2.txt", "persist"]);

        let manifest = fx.store().load().unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.get("recipe2.txt"), Some(hash_bytes(b"Daiquiri: rum, lime, sugar").as_str()));
        assert!(!IngestLock::path_for(fx.config.manifest_path()).exists());
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let fx = Fixture::new();
        fx.write("recipe1.txt", "Margarita");
        fx.ingestor(fx.service()).run().await.unwrap();
        let before = fx.manifest_bytes();

        let svc = fx.service();
        let outcome = fx.ingestor(svc.clone()).run().await.unwrap();

        assert_eq!(outcome, IngestOutcome::NoChanges);
        assert_eq!(svc.calls(), vec!["load"]);
        assert_eq!(fx.manifest_bytes(), before);
    }

    #[tokio::test]
    async fn test_only_new_and_modified_files_are_inserted() {
        let fx = Fixture::new();
        fx.write("a.txt", "alpha");
        fx.write("b.txt", "bravo");
        fx.write("c.txt", "charlie");
        fx.ingestor(fx.service()).run().await.unwrap();

        fx.write("b.txt", "bravo, stirred not shaken");
        fx.write("d.txt", "delta");
        let svc = fx.service();
        let outcome = fx.ingestor(svc.clone()).run().await.unwrap();

        assert_eq!(
            outcome,
            IngestOutcome::Updated {
                files: vec!["b.txt".to_string(), "d.txt".to_string()]
            }
        );
        assert_eq!(svc.inserted(), vec!["b.txt", "d.txt"]);

        let manifest = fx.store().load().unwrap();
        assert_eq!(manifest.len(), 4);
        assert_eq!(manifest.get("b.txt"), Some(hash_bytes(b"bravo, stirred not shaken").as_str()));
        assert_eq!(manifest.get("a.txt"), Some(hash_bytes(b"alpha").as_str()));
    }

    #[tokio::test]
    async fn test_recipe_scenario_end_to_end() {
        let fx = Fixture::new();
        fx.write("recipe1.txt", "Negroni: gin, Campari, sweet vermouth");
        let first = fx.ingestor(fx.service()).run().await.unwrap();
        assert!(matches!(first, IngestOutcome::Indexed { .. }));
        assert_eq!(
            fx.store().load().unwrap().get("recipe1.txt"),
            Some(hash_bytes(b"Negroni: gin, Campari, sweet vermouth").as_str())
        );

        fx.write("recipe1.txt", "Negroni: gin, Campari, sweet vermouth, orange peel");
        fx.write("recipe2.txt", "Mojito: rum, mint, lime, sugar, soda");
        let svc = fx.service();
        let second = fx.ingestor(svc.clone()).run().await.unwrap();
        assert_eq!(
            second,
            IngestOutcome::Updated {
                files: vec!["recipe1.txt".to_string(), "recipe2.txt".to_string()]
            }
        );
        assert_eq!(svc.inserted(), vec!["recipe1.txt", "recipe2.txt"]);

        let manifest = fx.store().load().unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(
            manifest.get("recipe1.txt"),
            Some(hash_bytes(b"Negroni: gin, Campari, sweet vermouth, orange peel").as_str())
        );
        assert_eq!(
            manifest.get("recipe2.txt"),
            Some(hash_bytes(b"Mojito: rum, mint, lime, sugar, soda").as_str())
        );

        let third = fx.ingestor(fx.service()).run().await.unwrap();
        assert_eq!(third, IngestOutcome::NoChanges);

        let persisted = fs::read_to_string(fx.service().index_file()).unwrap();
        assert!(persisted.contains("orange peel") && persisted.contains("Mojito"));
    }

    /// Starts the real write, then stalls until the caller gives up on it.
    struct StalledPersist(SqliteIndexService);

    #[async_trait]
    impl IndexService for StalledPersist {
        type Index = VectorIndex;

        async fn build(&self, docs: Vec<Document>) -> Result<VectorIndex> {
            self.0.build(docs).await
        }

        async fn load(&self) -> Result<VectorIndex> {
            self.0.load().await
        }

        async fn insert(&self, index: &mut VectorIndex, docs: Vec<Document>) -> Result<()> {
            self.0.insert(index, docs).await
        }

        async fn persist(&self, index: &mut VectorIndex) -> Result<()> {
            let mut write = self.0.persist(index);
            let _ = futures_util::poll!(&mut write);
            std::future::pending::<Result<()>>().await
        }
    }

    #[tokio::test]
    async fn test_timed_out_rebuild_can_be_retried() {
        let fx = Fixture::new();
        fx.write("recipe1.txt", "Negroni: gin, Campari, sweet vermouth");
        fx.write("recipe2.txt", "Mojito: rum, mint, lime, sugar, soda");
        let sqlite = || {
            SqliteIndexService::new(
                fx.config.storage_dir(),
                Arc::new(FakeEmbedder::new()),
                fx.config.ingest.clone(),
            )
        };

        let err = Ingestor::new(&fx.config, fx.store(), StalledPersist(sqlite()))
            .with_timeout(Some(Duration::from_millis(50)))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ShakerError::Phase { phase: IngestPhase::PersistIndex, .. }));
        assert!(matches!(err.root(), ShakerError::Timeout { .. }));
        assert!(err.is_recoverable());
        assert!(fx.manifest_bytes().is_none());

        // Whether or not the abandoned write got as far as the rename, the
        // retry must end with both files indexed and recorded.
        let outcome = Ingestor::new(&fx.config, fx.store(), sqlite())
            .with_timeout(None)
            .run()
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Indexed { .. } | IngestOutcome::Updated { .. }));

        let index = sqlite().load().await.unwrap();
        assert_eq!(index.document_count(), 2);
        let manifest = fx.store().load().unwrap();
        assert_eq!(
            manifest.get("recipe2.txt"),
            Some(hash_bytes(b"Mojito: rum, mint, lime, sugar, soda").as_str())
        );
        assert_eq!(manifest.len(), 2);
    }

    #[tokio::test]
    async fn test_persist_failure_leaves_manifest_untouched() {
        let fx = Fixture::new();
        fx.write("recipe1.txt", "Negroni");
        fx.ingestor(fx.service()).run().await.unwrap();
        let before = fx.manifest_bytes();

        fx.write("recipe2.txt", "Mojito");
        let err = fx
            .ingestor(fx.service().failing("persist"))
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, ShakerError::Phase { phase: IngestPhase::PersistIndex, .. }));
        assert!(err.is_recoverable());
        assert_eq!(fx.manifest_bytes(), before);

        // The retry picks the same file up again.
        let svc = fx.service();
        fx.ingestor(svc.clone()).run().await.unwrap();
        assert_eq!(svc.inserted(), vec!["recipe2.txt"]);
    }

    #[tokio::test]
    async fn test_insert_failure_names_phase_and_skips_persist() {
        let fx = Fixture::new();
        fx.write("recipe1.txt", "Negroni");
        fx.ingestor(fx.service()).run().await.unwrap();
        fx.write("recipe1.txt", "Negroni, stirred");

        let svc = fx.service().failing("insert");
        let err = fx.ingestor(svc.clone()).run().await.unwrap_err();

        assert!(err.to_string().contains("inserting documents"));
        assert!(!svc.calls().contains(&"persist".to_string()));
        assert_eq!(fx.store().load().unwrap().get("recipe1.txt"), Some(hash_bytes(b"Negroni").as_str()));
    }

    #[tokio::test]
    async fn test_bootstrap_failure_writes_no_manifest() {
        let fx = Fixture::new();
        fx.write("recipe1.txt", "Negroni");

        let err = fx.ingestor(fx.service().failing("build")).run().await.unwrap_err();
        assert!(matches!(err, ShakerError::Phase { phase: IngestPhase::BuildIndex, .. }));
        assert!(fx.manifest_bytes().is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_ignores_stale_manifest() {
        let fx = Fixture::new();
        fx.write("recipe1.txt", "Negroni");
        let stale: Manifest = [("recipe1.txt", hash_bytes(b"Negroni")), ("gone.txt", "00".repeat(32))]
            .into_iter()
            .collect();
        fx.store().save(&stale).unwrap();

        let svc = fx.service();
        let outcome = fx.ingestor(svc.clone()).run().await.unwrap();

        assert!(matches!(outcome, IngestOutcome::Indexed { .. }));
        assert_eq!(svc.calls(), vec!["build:recipe1.txt", "persist"]);
        assert!(!fx.store().load().unwrap().contains("gone.txt"));
    }

    #[tokio::test]
    async fn test_force_rebuilds_existing_index() {
        let fx = Fixture::new();
        fx.write("recipe1.txt", "Negroni");
        fx.ingestor(fx.service()).run().await.unwrap();

        let svc = fx.service();
        let outcome = fx.ingestor(svc.clone()).with_force(true).run().await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Indexed { .. }));
        assert_eq!(svc.calls(), vec!["build:recipe1.txt", "persist"]);
    }

    #[tokio::test]
    async fn test_timeout_is_tagged_with_phase() {
        let fx = Fixture::new();
        fx.write("recipe1.txt", "Negroni");

        let err = fx
            .ingestor(fx.service().hanging("build"))
            .with_timeout(Some(Duration::from_millis(20)))
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err.root(), ShakerError::Timeout { .. }));
        assert!(matches!(err, ShakerError::Phase { phase: IngestPhase::BuildIndex, .. }));
        assert!(fx.manifest_bytes().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_run_is_locked_out() {
        let fx = Fixture::new();
        fx.write("recipe1.txt", "Negroni");
        let _held = IngestLock::acquire(fx.config.manifest_path()).unwrap();

        let err = fx.ingestor(fx.service()).run().await.unwrap_err();
        assert!(matches!(err, ShakerError::Locked(_)));
    }

    #[tokio::test]
    async fn test_empty_directory_and_missing_files() {
        let fx = Fixture::new();
        let svc = fx.service();
        assert_eq!(fx.ingestor(svc.clone()).run().await.unwrap(), IngestOutcome::NoChanges);
        assert!(svc.calls().is_empty());

        fx.write("recipe1.txt", "Negroni");
        fx.write("recipe2.txt", "Mojito");
        fx.ingestor(fx.service()).run().await.unwrap();
        fx.remove("recipe1.txt");

        let ingestor = fx.ingestor(fx.service());
        assert_eq!(ingestor.run().await.unwrap(), IngestOutcome::NoChanges);
        assert_eq!(ingestor.missing_files().unwrap(), vec!["recipe1.txt"]);
        assert!(fx.store().load().unwrap().contains("recipe1.txt"));
    }

    #[tokio::test]
    async fn test_corrupt_manifest_aborts_incremental_run() {
        let fx = Fixture::new();
        fx.write("recipe1.txt", "Negroni");
        fx.ingestor(fx.service()).run().await.unwrap();
        fs::write(fx.config.manifest_path(), b"[1, 2, 3]").unwrap();

        let err = fx.ingestor(fx.service()).run().await.unwrap_err();
        assert!(matches!(err, ShakerError::CorruptManifest { .. }));
        assert!(!err.is_recoverable());
    }
}
