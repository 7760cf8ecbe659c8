use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task;
use uuid::Uuid;

use crate::config::{IngestConfig, INDEX_FILE_NAME};
use crate::db::{create_schema, Db, SCHEMA_VERSION};
use crate::error::{Result, ShakerError};
use crate::ingest::chunk_text;
use crate::llm::Embedder;
use crate::search::{encode_embedding, parse_embedding, rank_top_k};
use super::{Document, IndexService, BUILDING_MARKER};

/// One embedded slice of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedChunk {
    pub chunk_id: String,
    pub file_name: String,
    pub chunk_index: usize,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// A retrieval hit. `rank` starts at 1.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub file_name: String,
    pub chunk_index: usize,
    pub text: String,
    pub score: f32,
    pub rank: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub file_name: String,
    pub digest: String,
    pub text: String,
    pub ingested_at: DateTime<Utc>,
}

/// In-memory view of the persisted index plus changes not yet persisted.
#[derive(Debug)]
pub struct VectorIndex {
    db_path: PathBuf,
    embedding_model: String,
    documents: BTreeMap<String, StoredDocument>,
    chunks: Vec<IndexedChunk>,
    pending: Vec<String>,
    // Built from scratch; the next persist replaces the database wholesale.
    fresh: bool,
}

impl VectorIndex {
    fn empty(db_path: PathBuf, embedding_model: &str) -> Self {
        Self {
            db_path,
            embedding_model: embedding_model.to_string(),
            documents: BTreeMap::new(),
            chunks: Vec::new(),
            pending: Vec::new(),
            fresh: true,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Documents ordered by file name
    pub fn documents(&self) -> impl Iterator<Item = &StoredDocument> {
        self.documents.values()
    }

    pub fn document(&self, file_name: &str) -> Option<&StoredDocument> {
        self.documents.get(file_name)
    }

    pub fn chunks(&self) -> &[IndexedChunk] {
        &self.chunks
    }

    /// Whether staged changes are waiting for `persist`
    pub fn has_pending(&self) -> bool {
        self.fresh || !self.pending.is_empty()
    }

    /// The `k` chunks most similar to `query` scoring at least `min_score`.
    pub fn top_k(&self, query: &[f32], k: usize, min_score: f32) -> Vec<ScoredChunk> {
        let candidates = self.chunks.iter().map(|c| (c, c.embedding.as_slice()));
        rank_top_k(query, candidates, k, min_score)
            .into_iter()
            .enumerate()
            .map(|(i, (score, chunk))| ScoredChunk {
                file_name: chunk.file_name.clone(),
                chunk_index: chunk.chunk_index,
                text: chunk.text.clone(),
                score,
                rank: i + 1,
            })
            .collect()
    }

    // Replaces whatever the index held for this file.
    fn stage(&mut self, doc: Document, chunks: Vec<IndexedChunk>) {
        let name = doc.name.clone();
        self.chunks.retain(|c| c.file_name != name);
        self.chunks.extend(chunks);
        self.documents.insert(
            name.clone(),
            StoredDocument {
                file_name: name.clone(),
                digest: doc.digest,
                text: doc.text,
                ingested_at: Utc::now(),
            },
        );
        if !self.pending.contains(&name) {
            self.pending.push(name);
        }
    }

    fn chunks_of(&self, file_name: &str) -> Vec<IndexedChunk> {
        self.chunks
            .iter()
            .filter(|c| c.file_name == file_name)
            .cloned()
            .collect()
    }
}

/// Index backend persisting to a SQLite file in the storage directory.
pub struct SqliteIndexService {
    storage_dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    chunking: IngestConfig,
}

impl SqliteIndexService {
    pub fn new(storage_dir: impl Into<PathBuf>, embedder: Arc<dyn Embedder>, chunking: IngestConfig) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            embedder,
            chunking,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join(INDEX_FILE_NAME)
    }

    async fn embed_document(&self, doc: &Document) -> Result<Vec<IndexedChunk>> {
        let pieces = chunk_text(&doc.text, &self.chunking);
        if pieces.is_empty() {
            log::warn!("{} has no text to embed", doc.name);
            return Ok(Vec::new());
        }

        let embeddings = self.embedder.embed_batch(pieces.clone()).await?;
        if embeddings.len() != pieces.len() {
            return Err(ShakerError::Backend(format!(
                "Expected {} embeddings for {}, got {}",
                pieces.len(),
                doc.name,
                embeddings.len()
            )));
        }

        Ok(pieces
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(chunk_index, (text, embedding))| IndexedChunk {
                chunk_id: Uuid::new_v4().to_string(),
                file_name: doc.name.clone(),
                chunk_index,
                text,
                embedding,
            })
            .collect())
    }

    async fn stage_all(&self, index: &mut VectorIndex, docs: Vec<Document>) -> Result<()> {
        for doc in docs {
            let chunks = self.embed_document(&doc).await?;
            log::debug!("Embedded {} ({} chunks)", doc.name, chunks.len());
            index.stage(doc, chunks);
        }
        Ok(())
    }

    // Written to a private file beside the live one and renamed over it from
    // the blocking task. A failed or abandoned rebuild removes its own file
    // and leaves the previous index untouched.
    async fn persist_fresh(&self, index: &VectorIndex) -> Result<()> {
        std::fs::create_dir_all(&self.storage_dir)?;
        remove_abandoned_builds(&self.storage_dir)?;
        let building = self.storage_dir.join(format!(
            "{}{}{}",
            INDEX_FILE_NAME,
            BUILDING_MARKER,
            Uuid::new_v4().simple()
        ));
        let live = index.db_path.clone();

        let model = index.embedding_model.clone();
        let documents: Vec<StoredDocument> = index.documents.values().cloned().collect();
        let chunks = index.chunks.clone();

        let abandoned = Arc::new(AtomicBool::new(false));
        let _guard = AbandonOnDrop(abandoned.clone());

        task::spawn_blocking(move || {
            let written = write_fresh(&Db::new(&building), &model, &documents, &chunks).and_then(|()| {
                if abandoned.load(Ordering::SeqCst) {
                    return Err(ShakerError::Io(std::io::Error::other("index rebuild was abandoned")));
                }
                // A leftover log from the old database must not be replayed onto the new one.
                remove_sidecars(&live)?;
                std::fs::rename(&building, &live)?;
                Ok(())
            });
            if written.is_err() {
                if let Err(e) = remove_database_files(&building) {
                    log::warn!("Could not remove partial index {}: {}", building.display(), e);
                }
            }
            written
        })
        .await
        .map_err(|e| ShakerError::Io(std::io::Error::other(format!("database task failed: {}", e))))?
    }

    async fn persist_pending(&self, index: &VectorIndex) -> Result<()> {
        let mut updates = Vec::with_capacity(index.pending.len());
        for name in &index.pending {
            let doc = index
                .documents
                .get(name)
                .cloned()
                .ok_or_else(|| ShakerError::InvalidInput(format!("staged document {} is missing", name)))?;
            updates.push((doc, index.chunks_of(name)));
        }

        Db::new(&index.db_path)
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                for (doc, chunks) in &updates {
                    let refs: Vec<&IndexedChunk> = chunks.iter().collect();
                    replace_document(&tx, doc, &refs)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl IndexService for SqliteIndexService {
    type Index = VectorIndex;

    async fn build(&self, docs: Vec<Document>) -> Result<VectorIndex> {
        let mut index = VectorIndex::empty(self.db_path(), self.embedder.model());
        self.stage_all(&mut index, docs).await?;
        Ok(index)
    }

    async fn load(&self) -> Result<VectorIndex> {
        load_index(&self.db_path(), Some(self.embedder.model())).await
    }

    async fn insert(&self, index: &mut VectorIndex, docs: Vec<Document>) -> Result<()> {
        self.stage_all(index, docs).await
    }

    async fn persist(&self, index: &mut VectorIndex) -> Result<()> {
        if index.fresh {
            self.persist_fresh(index).await?;
        } else if !index.pending.is_empty() {
            self.persist_pending(index).await?;
        }
        index.fresh = false;
        index.pending.clear();
        Ok(())
    }
}

/// Read a persisted index into memory.
///
/// With `expected_model` set, an index embedded with a different model is
/// refused. Every failure surfaces as [`ShakerError::IndexLoad`].
pub async fn load_index(db_path: &Path, expected_model: Option<&str>) -> Result<VectorIndex> {
    if !db_path.is_file() {
        return Err(ShakerError::IndexLoad(format!(
            "no index database at {}",
            db_path.display()
        )));
    }

    let path = db_path.to_path_buf();
    let expected = expected_model.map(str::to_string);
    let loaded = Db::new(db_path)
        .with_connection(move |conn| read_index(conn, path, expected.as_deref()))
        .await;

    loaded.map_err(|e| match e {
        ShakerError::IndexLoad(_) => e,
        other => ShakerError::IndexLoad(other.to_string()),
    })
}

fn read_index(conn: &mut Connection, db_path: PathBuf, expected_model: Option<&str>) -> Result<VectorIndex> {
    let version = read_meta(conn, "schema_version")?;
    if version.as_deref() != Some(SCHEMA_VERSION) {
        return Err(ShakerError::IndexLoad(format!(
            "unsupported schema version {:?} in {}",
            version,
            db_path.display()
        )));
    }

    let model = read_meta(conn, "embedding_model")?.unwrap_or_default();
    if let Some(expected) = expected_model {
        if model != expected {
            return Err(ShakerError::IndexLoad(format!(
                "index was embedded with {:?} but {:?} is configured; rebuild with --force",
                model, expected
            )));
        }
    }

    let mut index = VectorIndex::empty(db_path, &model);
    index.fresh = false;

    let mut stmt = conn.prepare(
        "SELECT file_name, file_hash, content_text, ingested_at FROM documents ORDER BY file_name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;
    for row in rows {
        let (file_name, digest, text, ingested_at) = row?;
        let ingested_at = DateTime::parse_from_rfc3339(&ingested_at)
            .map_err(|e| ShakerError::IndexLoad(format!("bad timestamp for {}: {}", file_name, e)))?
            .with_timezone(&Utc);
        index.documents.insert(
            file_name.clone(),
            StoredDocument {
                file_name,
                digest,
                text,
                ingested_at,
            },
        );
    }

    let mut stmt = conn.prepare(
        "SELECT c.chunk_id, d.file_name, c.chunk_index, c.chunk_text, c.embedding
         FROM chunks c JOIN documents d ON d.doc_id = c.doc_id
         ORDER BY d.file_name, c.chunk_index",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Vec<u8>>(4)?,
        ))
    })?;
    for row in rows {
        let (chunk_id, file_name, chunk_index, text, blob) = row?;
        let embedding = parse_embedding(&blob)
            .ok_or_else(|| ShakerError::IndexLoad(format!("corrupt embedding for chunk {}", chunk_id)))?;
        index.chunks.push(IndexedChunk {
            chunk_id,
            file_name,
            chunk_index: chunk_index as usize,
            text,
            embedding,
        });
    }

    Ok(index)
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM index_meta WHERE key = ?1", [key], |row| row.get(0))
        .optional()?;
    Ok(value)
}

fn write_meta(tx: &Transaction<'_>, embedding_model: &str) -> Result<()> {
    let mut stmt = tx.prepare("INSERT OR REPLACE INTO index_meta (key, value) VALUES (?1, ?2)")?;
    stmt.execute(params!["schema_version", SCHEMA_VERSION])?;
    stmt.execute(params!["embedding_model", embedding_model])?;
    Ok(())
}

// Chunks of the previous version go with it through ON DELETE CASCADE.
fn replace_document(tx: &Transaction<'_>, doc: &StoredDocument, chunks: &[&IndexedChunk]) -> Result<()> {
    tx.execute("DELETE FROM documents WHERE file_name = ?1", [&doc.file_name])?;

    let doc_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO documents (doc_id, file_name, file_hash, content_text, ingested_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![doc_id, doc.file_name, doc.digest, doc.text, doc.ingested_at.to_rfc3339()],
    )?;

    let mut stmt = tx.prepare(
        "INSERT INTO chunks (chunk_id, doc_id, chunk_index, chunk_text, embedding)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for chunk in chunks {
        stmt.execute(params![
            chunk.chunk_id,
            doc_id,
            chunk.chunk_index as i64,
            chunk.text,
            encode_embedding(&chunk.embedding),
        ])?;
    }
    Ok(())
}

/// Flags the blocking rebuild once the future driving it is dropped.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

// The connection is closed on return so its log is checkpointed before the rename.
fn write_fresh(db: &Db, model: &str, documents: &[StoredDocument], chunks: &[IndexedChunk]) -> Result<()> {
    let mut conn = db.open_connection()?;
    create_schema(&conn)?;
    let tx = conn.transaction()?;
    write_meta(&tx, model)?;
    for doc in documents {
        let doc_chunks: Vec<&IndexedChunk> = chunks.iter().filter(|c| c.file_name == doc.file_name).collect();
        replace_document(&tx, doc, &doc_chunks)?;
    }
    tx.commit()?;
    Ok(())
}

/// Remove rebuild files left by a run that crashed before cleaning up.
fn remove_abandoned_builds(storage_dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(storage_dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().contains(BUILDING_MARKER) {
            log::debug!("Removing abandoned rebuild file {}", entry.path().display());
            remove_if_exists(&entry.path())?;
        }
    }
    Ok(())
}

fn remove_database_files(db_path: &Path) -> Result<()> {
    remove_if_exists(db_path)?;
    remove_sidecars(db_path)
}

fn remove_sidecars(db_path: &Path) -> Result<()> {
    for suffix in ["-wal", "-shm"] {
        let mut name = db_path.as_os_str().to_os_string();
        name.push(suffix);
        remove_if_exists(Path::new(&name))?;
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
