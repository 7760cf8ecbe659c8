use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::OllamaConfig;
use crate::error::{Result, ShakerError};
use super::{Embedder, Generator};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Request body for `/api/embed`
#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<String>,
}

/// Response body of `/api/embed`
#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Request body for `/api/generate`
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// One NDJSON line of a streamed `/api/generate` response
#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// What a single streamed line means for the consumer.
#[derive(Debug, PartialEq)]
enum StreamLine {
    Fragment(String),
    /// The closing line, still carrying text.
    Last(String),
    Done,
    Skip,
}

/// Client for a local Ollama daemon: embeddings and streamed generation.
#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
    embedding_model: String,
    llm_model: String,
    batch_size: usize,
    request_timeout: Duration,
}

impl OllamaClient {
    /// Build a client from config.
    ///
    /// Only the connect phase has a client-wide timeout; embedding and health
    /// requests are bounded by `request_timeout_secs`, generation streams are not.
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ShakerError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            embedding_model: config.embedding_model.clone(),
            llm_model: config.llm_model.clone(),
            batch_size: config.batch_size.max(1),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn llm_model(&self) -> &str {
        &self.llm_model
    }

    /// Whether the daemon answers at all
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).timeout(self.request_timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Names of the models pulled into the daemon
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let res = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        let res = self.check_status(res, "/api/tags").await?;

        let tags: TagsResponse = res
            .json()
            .await
            .map_err(|e| ShakerError::Backend(format!("Failed to parse /api/tags response: {}", e)))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Models from config that the daemon does not have yet
    pub async fn missing_models(&self) -> Result<Vec<String>> {
        let available = self.list_models().await?;
        let has = |wanted: &str| {
            available
                .iter()
                .any(|name| name == wanted || name.strip_suffix(":latest") == Some(wanted))
        };
        Ok([self.embedding_model.as_str(), self.llm_model.as_str()]
            .into_iter()
            .filter(|m| !has(*m))
            .map(String::from)
            .collect())
    }

    async fn embed_request(&self, input: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let expected = input.len();
        let url = format!("{}/api/embed", self.base_url);
        let request = EmbedRequest {
            model: &self.embedding_model,
            input,
        };

        let res = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        let res = self.check_status(res, "/api/embed").await?;

        let result: EmbedResponse = res
            .json()
            .await
            .map_err(|e| ShakerError::Backend(format!("Failed to parse /api/embed response: {}", e)))?;

        if result.embeddings.len() != expected {
            return Err(ShakerError::Backend(format!(
                "/api/embed returned {} embeddings for {} inputs",
                result.embeddings.len(),
                expected
            )));
        }
        Ok(result.embeddings)
    }

    /// Connect failures and timeouts mean the daemon is unreachable; anything
    /// else is a bad exchange with a reachable daemon.
    fn request_error(&self, e: reqwest::Error) -> ShakerError {
        if e.is_connect() || e.is_timeout() {
            ShakerError::ServiceUnavailable {
                endpoint: self.base_url.clone(),
                reason: e.to_string(),
            }
        } else {
            ShakerError::Backend(format!("Request to {} failed: {}", self.base_url, e))
        }
    }

    async fn check_status(&self, res: reqwest::Response, route: &str) -> Result<reqwest::Response> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);
        Err(ShakerError::Backend(format!("{} returned {}: {}", route, status, detail)))
    }
}

#[async_trait]
impl Embedder for OllamaClient {
    fn model(&self) -> &str {
        &self.embedding_model
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            all.extend(self.embed_request(batch.to_vec()).await?);
        }
        Ok(all)
    }
}

#[async_trait]
impl Generator for OllamaClient {
    async fn generate_stream(&self, prompt: String) -> Result<mpsc::Receiver<Result<String>>> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model: &self.llm_model,
            prompt: &prompt,
            stream: true,
        };

        let res = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        let res = self.check_status(res, "/api/generate").await?;

        let (tx, rx) = mpsc::channel(32);
        let mut stream = res.bytes_stream();

        tokio::spawn(async move {
            let mut pending: Vec<u8> = Vec::new();
            while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ShakerError::Backend(format!("Generation stream interrupted: {}", e))))
                            .await;
                        return;
                    }
                };
                pending.extend_from_slice(&bytes);

                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    match parse_stream_line(&line) {
                        Ok(StreamLine::Fragment(text)) => {
                            if tx.send(Ok(text)).await.is_err() {
                                // Consumer went away.
                                return;
                            }
                        }
                        Ok(StreamLine::Last(text)) => {
                            let _ = tx.send(Ok(text)).await;
                            return;
                        }
                        Ok(StreamLine::Done) => return,
                        Ok(StreamLine::Skip) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }

            let outcome = parse_stream_line(&pending);
            let _ = match outcome {
                Ok(StreamLine::Fragment(text)) => tx.send(Ok(text)).await,
                Ok(StreamLine::Last(text)) => tx.send(Ok(text)).await,
                Ok(StreamLine::Done) => Ok(()),
                Ok(StreamLine::Skip) => {
                    tx.send(Err(ShakerError::Backend(
                        "Generation stream ended before completion".to_string(),
                    )))
                    .await
                }
                Err(e) => tx.send(Err(e)).await,
            };
        });

        Ok(rx)
    }
}

fn parse_stream_line(line: &[u8]) -> Result<StreamLine> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(StreamLine::Skip);
    }

    let chunk: GenerateChunk = serde_json::from_str(text)
        .map_err(|e| ShakerError::Backend(format!("Malformed generation chunk: {}", e)))?;

    if let Some(error) = chunk.error {
        return Err(ShakerError::Backend(error));
    }
    if chunk.done {
        return Ok(if chunk.response.is_empty() {
            StreamLine::Done
        } else {
            StreamLine::Last(chunk.response)
        });
    }
    if chunk.response.is_empty() {
        Ok(StreamLine::Skip)
    } else {
        Ok(StreamLine::Fragment(chunk.response))
    }
}
