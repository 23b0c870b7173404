//! External collaborator contracts and their HTTP implementations.
//!
//! The engine never performs extraction, embedding, text generation, or
//! relevance scoring itself — those are external, fallible services behind
//! the traits defined here. Every trait method may fail or time out, and
//! callers are expected to degrade rather than abort (see `context` and
//! `search`).
//!
//! Also provides vector utilities for BLOB storage:
//! - [`vec_to_blob`] / [`blob_to_vec`] — little-endian f32 encoding
//! - [`cosine_similarity`] — similarity between two embedding vectors

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::ServicesConfig;
use crate::models::Source;

/// Raw chunk produced by an extractor, before normalization into a stored
/// `Chunk` row.
#[derive(Debug, Clone)]
pub struct ExtractedChunk {
    pub text: String,
    pub page_start: Option<i64>,
    pub page_end: Option<i64>,
    pub section_hint: Option<String>,
    pub heading_path: Vec<String>,
}

/// Turns a source locator into an ordered sequence of raw chunks with
/// page/heading metadata.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, source: &Source) -> Result<Vec<ExtractedChunk>>;
}

/// Fixed-dimensionality text embedding. Batch calls return vectors in input
/// order.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Prompt-in, text-out generation (contextual prefixes, drafting, critique).
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Pairwise relevance model: one scalar score per (query, passage) pair.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;
}

// ============ Local text extraction ============

/// Extractor for sources whose `uri` is a local text or markdown file.
/// Paragraphs are grouped into chunks of roughly `max_chars`; markdown
/// headings update the heading path carried on subsequent chunks.
pub struct TextFileExtractor {
    max_chars: usize,
}

impl TextFileExtractor {
    pub fn new() -> Self {
        Self { max_chars: 1500 }
    }
}

impl Default for TextFileExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extractor for TextFileExtractor {
    async fn extract(&self, source: &Source) -> Result<Vec<ExtractedChunk>> {
        let text = tokio::fs::read_to_string(&source.uri)
            .await
            .map_err(|e| anyhow::anyhow!("cannot read {}: {}", source.uri, e))?;

        let mut chunks = Vec::new();
        let mut heading_path: Vec<String> = Vec::new();
        let mut buffer = String::new();

        let flush = |buffer: &mut String, heading_path: &[String], chunks: &mut Vec<ExtractedChunk>| {
            let text = buffer.trim();
            if !text.is_empty() {
                chunks.push(ExtractedChunk {
                    text: text.to_string(),
                    page_start: None,
                    page_end: None,
                    section_hint: heading_path.last().cloned(),
                    heading_path: heading_path.to_vec(),
                });
            }
            buffer.clear();
        };

        for paragraph in text.split("\n\n") {
            let trimmed = paragraph.trim();
            if trimmed.is_empty() {
                continue;
            }

            if let Some(heading) = trimmed.strip_prefix('#') {
                flush(&mut buffer, &heading_path, &mut chunks);
                let level = trimmed.chars().take_while(|c| *c == '#').count();
                let title = heading.trim_start_matches('#').trim().to_string();
                heading_path.truncate(level.saturating_sub(1));
                if !title.is_empty() {
                    heading_path.push(title);
                }
                continue;
            }

            if !buffer.is_empty() && buffer.len() + trimmed.len() > self.max_chars {
                flush(&mut buffer, &heading_path, &mut chunks);
            }
            if !buffer.is_empty() {
                buffer.push_str("\n\n");
            }
            buffer.push_str(trimmed);
        }
        flush(&mut buffer, &heading_path, &mut chunks);

        Ok(chunks)
    }
}

// ============ OpenAI embedding service ============

/// Embedding via the OpenAI `POST /v1/embeddings` endpoint.
///
/// Retry strategy:
/// - HTTP 429 or 5xx → retry with exponential backoff (1s, 2s, 4s, ... capped)
/// - HTTP 4xx (not 429) → fail immediately
/// - Network error → retry
pub struct OpenAiEmbeddings {
    model: String,
    dims: usize,
    timeout: Duration,
    max_retries: u32,
}

impl OpenAiEmbeddings {
    pub fn new(config: &ServicesConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self {
            model: config.embedding_model.clone(),
            dims: config.embedding_dims,
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingService for OpenAiEmbeddings {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_embedding_response(&json);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("embedding API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("embedding API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("embedding failed after retries")))
    }
}

fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("invalid embedding response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());

    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("invalid embedding response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        embeddings.push(vec);
    }

    Ok(embeddings)
}

// ============ OpenAI text generation ============

/// Text generation via the OpenAI chat completions endpoint. Used for the
/// contextual-prefix call; failures here are expected and non-fatal.
pub struct OpenAiGenerator {
    model: String,
    timeout: Duration,
}

impl OpenAiGenerator {
    pub fn new(config: &ServicesConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self {
            model: config.context_model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.3,
            "max_tokens": 200,
        });

        let response = client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("generation API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let text = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| anyhow::anyhow!("invalid generation response"))?;

        Ok(text.trim().to_string())
    }
}

// ============ HTTP reranking service ============

/// Pairwise relevance scoring via a generic HTTP endpoint:
/// `POST { query, passages: [...] } -> { scores: [...] }`.
pub struct HttpReranker {
    url: String,
    timeout: Duration,
}

impl HttpReranker {
    pub fn new(config: &ServicesConfig) -> Result<Self> {
        let url = config
            .rerank_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("services.rerank_url not configured"))?;
        Ok(Self {
            url,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl RelevanceScorer for HttpReranker {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let client = reqwest::Client::builder().timeout(self.timeout).build()?;
        let body = serde_json::json!({
            "query": query,
            "passages": passages,
        });

        let response = client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            bail!("rerank API error {}", status);
        }

        let json: serde_json::Value = response.json().await?;
        let scores = json
            .get("scores")
            .and_then(|s| s.as_array())
            .ok_or_else(|| anyhow::anyhow!("invalid rerank response: missing scores"))?;

        if scores.len() != passages.len() {
            bail!(
                "rerank returned {} scores for {} passages",
                scores.len(),
                passages.len()
            );
        }

        Ok(scores
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect())
    }
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`. Returns `0.0` for empty vectors or
/// mismatched lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
