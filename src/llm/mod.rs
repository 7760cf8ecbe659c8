pub mod ollama;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub use ollama::OllamaClient;

/// Turns text into vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model name recorded alongside stored vectors
    fn model(&self) -> &str;

    /// One embedding per input, in input order
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;
}

/// Produces an answer as a stream of text fragments.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Start generation. Fragments arrive on the receiver; dropping it stops
    /// the producer. An `Err` item ends the stream.
    async fn generate_stream(&self, prompt: String) -> Result<mpsc::Receiver<Result<String>>>;
}
