use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the persisted index inside the storage directory.
pub const INDEX_FILE_NAME: &str = "index.db";

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub shaker: ShakerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub http_server: HttpServerConfig,
}

/// General settings
#[derive(Debug, Clone, Deserialize)]
pub struct ShakerConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Where inputs and persisted state live
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Flat directory of input files (not walked recursively).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory holding the persisted index.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// JSON record of file name -> content digest.
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,
}

/// Local model daemon settings
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    /// Upper bound for a single non-streaming request (embeddings, health).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Ingestion tuning
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_chunk_size_tokens")]
    pub chunk_size_tokens: usize,
    #[serde(default = "default_chunk_overlap_tokens")]
    pub chunk_overlap_tokens: usize,
    /// Bound on each index build/load/insert/persist step. Unbounded when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Retrieval settings for the chat path
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub min_score: f32,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

/// HTTP chat server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("recipes")
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("storage")
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from("ingested_files.json")
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_llm_model() -> String {
    "phi3:mini".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_batch_size() -> usize {
    32
}

fn default_chunk_size_tokens() -> usize {
    256
}

fn default_chunk_overlap_tokens() -> usize {
    32
}

fn default_top_k() -> usize {
    2
}

fn default_cache_capacity() -> usize {
    256
}

fn default_http_port() -> u16 {
    8501
}

impl Default for ShakerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            storage_dir: default_storage_dir(),
            manifest_path: default_manifest_path(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            embedding_model: default_embedding_model(),
            llm_model: default_llm_model(),
            request_timeout_secs: default_request_timeout_secs(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size_tokens: default_chunk_size_tokens(),
            chunk_overlap_tokens: default_chunk_overlap_tokens(),
            timeout_secs: None,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: 0.0,
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
            allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration
    ///
    /// Loads environment variables from a .env file (if present) first.
    /// The config file is taken from the SHAKER_CONFIG environment variable,
    /// which must then point at an existing file, or from ./config.toml, which
    /// is optional. SHAKER_OLLAMA_URL overrides `ollama.base_url`.
    ///
    /// Nothing is logged here since the logger is configured from the result;
    /// call [`Config::log_source`] once it is up.
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let mut config = match Self::source_path() {
            Some(path) => Self::from_file(&path)?,
            None => Config::default(),
        };

        if let Ok(url) = std::env::var("SHAKER_OLLAMA_URL") {
            config.ollama.base_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// The file `load` reads, if any
    pub fn source_path() -> Option<PathBuf> {
        match std::env::var("SHAKER_CONFIG") {
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => {
                let default_path = Path::new("config.toml");
                default_path.exists().then(|| default_path.to_path_buf())
            }
        }
    }

    pub fn log_source() {
        match Self::source_path() {
            Some(path) => log::info!("Loaded configuration from {}", path.display()),
            None => log::info!("No config.toml found, using built-in defaults"),
        }
    }

    /// Parse and validate a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse and validate config from TOML text
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(config_str).context("Invalid TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.ollama.base_url)
            .with_context(|| format!("ollama.base_url is not a valid URL: {}", self.ollama.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("ollama.base_url must use http or https, got {}", url.scheme());
        }

        if self.ollama.embedding_model.trim().is_empty() || self.ollama.llm_model.trim().is_empty() {
            anyhow::bail!("ollama.embedding_model and ollama.llm_model must be set");
        }

        if self.ollama.request_timeout_secs == 0 {
            anyhow::bail!("ollama.request_timeout_secs must be greater than 0");
        }

        if self.ollama.batch_size == 0 {
            anyhow::bail!("ollama.batch_size must be greater than 0");
        }

        if self.ingest.timeout_secs == Some(0) {
            anyhow::bail!("ingest.timeout_secs must be greater than 0 when set");
        }

        if self.ingest.chunk_size_tokens == 0 {
            anyhow::bail!("ingest.chunk_size_tokens must be greater than 0");
        }

        if self.ingest.chunk_overlap_tokens >= self.ingest.chunk_size_tokens {
            anyhow::bail!("ingest.chunk_overlap_tokens must be less than chunk_size_tokens");
        }

        if self.query.top_k == 0 {
            anyhow::bail!("query.top_k must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.query.min_score) {
            anyhow::bail!("query.min_score must be between 0.0 and 1.0");
        }

        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.paths.data_dir
    }

    pub fn storage_dir(&self) -> &Path {
        &self.paths.storage_dir
    }

    pub fn manifest_path(&self) -> &Path {
        &self.paths.manifest_path
    }

    /// Path of the SQLite file holding the persisted index
    pub fn index_path(&self) -> PathBuf {
        self.paths.storage_dir.join(INDEX_FILE_NAME)
    }

    pub fn ingest_timeout(&self) -> Option<Duration> {
        self.ingest.timeout_secs.map(Duration::from_secs)
    }
}
