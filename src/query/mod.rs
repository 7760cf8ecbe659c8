//! Question answering over a loaded index.
//!
//! [`QueryEngine::answer`] retrieves the most similar chunks, builds the QA
//! prompt and hands back an [`AnswerStream`] of text fragments. Dropping the
//! stream stops the generator. [`ChatSession`] layers ephemeral history on top.

use futures_util::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::cache::QueryEmbeddingCache;
use crate::config::QueryConfig;
use crate::error::{Result, ShakerError};
use crate::index::{ScoredChunk, VectorIndex};
use crate::llm::{Embedder, Generator};

pub struct QueryEngine {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    cache: QueryEmbeddingCache,
    top_k: usize,
    min_score: f32,
}

impl QueryEngine {
    /// Takes ownership of a loaded index; there is no engine without one.
    pub fn new(
        index: VectorIndex,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        config: &QueryConfig,
    ) -> Self {
        Self {
            index: Arc::new(index),
            embedder,
            generator,
            cache: QueryEmbeddingCache::new(config.cache_capacity),
            top_k: config.top_k.max(1),
            min_score: config.min_score,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Chunks most similar to `query`, best first
    pub async fn retrieve(&self, query: &str) -> Result<Vec<ScoredChunk>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ShakerError::InvalidInput("query is empty".to_string()));
        }

        let embedding = match self.cache.get(query) {
            Some(embedding) => embedding,
            None => {
                let embedding = self
                    .embedder
                    .embed_batch(vec![query.to_string()])
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| ShakerError::Backend("no embedding returned for query".to_string()))?;
                self.cache.put(query, embedding.clone());
                log::debug!("Cached query embedding ({} cached)", self.cache.len());
                embedding
            }
        };

        Ok(self.index.top_k(&embedding, self.top_k, self.min_score))
    }

    /// Retrieve context for `query` and start streaming the model's answer.
    pub async fn answer(&self, query: &str) -> Result<AnswerStream> {
        let sources = self.retrieve(query).await?;
        if sources.is_empty() {
            log::warn!("No chunks matched the query; answering without context");
        }
        let prompt = build_prompt(query.trim(), &sources);
        let rx = self.generator.generate_stream(prompt).await?;
        Ok(AnswerStream::new(rx, sources))
    }
}

/// QA prompt: retrieved context first, then the question.
pub fn build_prompt(query: &str, sources: &[ScoredChunk]) -> String {
    let context = sources
        .iter()
        .map(|s| format!("file_name: {}\n\n{}", s.file_name, s.text))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Context information is below.\n\
         ---------------------\n\
         {}\n\
         ---------------------\n\
         Given the context information and not prior knowledge, answer the query.\n\
         Query: {}\n\
         Answer: ",
        context, query
    )
}

/// Forward-only, read-once stream of answer fragments.
///
/// Ends after the first error. Dropping it closes the channel, which stops
/// the producer at its next send.
#[derive(Debug)]
pub struct AnswerStream {
    rx: mpsc::Receiver<Result<String>>,
    sources: Vec<ScoredChunk>,
    finished: bool,
}

impl AnswerStream {
    pub fn new(rx: mpsc::Receiver<Result<String>>, sources: Vec<ScoredChunk>) -> Self {
        Self {
            rx,
            sources,
            finished: false,
        }
    }

    /// Chunks the answer was grounded on
    pub fn sources(&self) -> &[ScoredChunk] {
        &self.sources
    }

    /// Drain the stream into one string.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(fragment) = self.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}

impl Stream for AnswerStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                self.rx.close();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed(String),
    Cancelled,
}

/// Conversation history for one chat session. Never persisted.
#[derive(Debug, Default)]
pub struct ChatSession {
    messages: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Ask one question, feeding fragments to `on_fragment` as they arrive.
    ///
    /// The user turn is recorded up front. The assistant turn is recorded only
    /// when the stream completes; if `cancel` resolves first or the stream
    /// fails, history keeps everything before this answer.
    pub async fn ask<C, F>(
        &mut self,
        engine: &QueryEngine,
        query: &str,
        cancel: C,
        mut on_fragment: F,
    ) -> Result<TurnOutcome>
    where
        C: Future<Output = ()>,
        F: FnMut(&str),
    {
        self.messages.push(ChatMessage {
            role: Role::User,
            content: query.to_string(),
        });

        tokio::pin!(cancel);
        let mut stream = tokio::select! {
            _ = &mut cancel => return Ok(TurnOutcome::Cancelled),
            stream = engine.answer(query) => stream?,
        };

        let mut answer = String::new();
        loop {
            tokio::select! {
                _ = &mut cancel => {
                    log::debug!("Answer cancelled after {} bytes", answer.len());
                    return Ok(TurnOutcome::Cancelled);
                }
                item = stream.next() => match item {
                    Some(Ok(fragment)) => {
                        on_fragment(&fragment);
                        answer.push_str(&fragment);
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                }
            }
        }

        self.messages.push(ChatMessage {
            role: Role::Assistant,
            content: answer.clone(),
        });
        Ok(TurnOutcome::Completed(answer))
    }
}
