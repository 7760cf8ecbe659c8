pub mod config;
pub mod error;
pub mod db;
pub mod ingest;
pub mod index;
pub mod search;
pub mod llm;
pub mod cache;
pub mod query;
pub mod server;
pub mod verify;

pub use config::Config;
pub use error::{IngestPhase, Result, ShakerError};
