//! Embedding providers and vector helpers.
//!
//! [`EmbeddingProvider`] abstracts over embedding backends:
//! - [`DisabledProvider`] fails every call; the rest of the pipeline
//!   treats that as "no semantic index yet".
//! - [`OpenAIProvider`] calls `POST /v1/embeddings` with batching and
//!   exponential backoff (1s, 2s, 4s, ... capped at 32s). HTTP 429 and
//!   5xx retry, other 4xx fail immediately, network errors retry.
//! - [`OllamaProvider`] calls a local Ollama `/api/embed` endpoint with
//!   the same retry strategy.
//!
//! Every returned vector is checked against the configured dimensionality;
//! a mismatch is a hard [`ThreatScopeError::DimensionMismatch`].
//!
//! Also provides the BLOB codec used for SQLite vector storage
//! ([`vec_to_blob`], [`blob_to_vec`]) and [`cosine_similarity`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::error::{Result, ThreatScopeError};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier, e.g. `"text-embedding-3-small"`.
    fn model_name(&self) -> &str;

    /// Vector dimensionality every embedding must have.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let mut vectors = provider.embed(&[text.to_string()]).await?;
    if vectors.is_empty() {
        return Err(ThreatScopeError::EmbeddingUnavailable(
            "empty embedding response".to_string(),
        ));
    }
    Ok(vectors.swap_remove(0))
}

/// Instantiate the provider named by the configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        other => Err(ThreatScopeError::Config(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

fn require_model(config: &EmbeddingConfig) -> Result<String> {
    config
        .model
        .clone()
        .ok_or_else(|| ThreatScopeError::Config("embedding.model is required".to_string()))
}

fn require_dims(config: &EmbeddingConfig) -> Result<usize> {
    config
        .dims
        .ok_or_else(|| ThreatScopeError::Config("embedding.dims is required".to_string()))
}

fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ThreatScopeError::Config(format!("http client: {}", e)))
}

/// Enforce the configured dimensionality on a full response batch.
fn check_dims(expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
    for v in vectors {
        if v.len() != expected {
            return Err(ThreatScopeError::DimensionMismatch {
                expected,
                actual: v.len(),
            });
        }
    }
    Ok(())
}

// ============ Disabled ============

/// Placeholder provider used when embeddings are not configured.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(ThreatScopeError::EmbeddingUnavailable(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ OpenAI ============

/// OpenAI embeddings API. Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
    batch_size: usize,
    max_retries: u32,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            ThreatScopeError::Config("OPENAI_API_KEY environment variable not set".to_string())
        })?;

        Ok(Self {
            model: require_model(config)?,
            dims: require_dims(config)?,
            api_key,
            client: build_client(config.timeout_secs)?,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err: Option<String> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(attempt, delay_secs = delay.as_secs(), "retrying openai embed");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            ThreatScopeError::EmbeddingUnavailable(format!(
                                "openai response body: {}",
                                e
                            ))
                        })?;
                        return parse_openai_response(&json);
                    }

                    // Rate limited or server error, retry.
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(format!("openai api error {}: {}", status, body_text));
                        continue;
                    }

                    // Other client errors do not retry.
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(ThreatScopeError::EmbeddingUnavailable(format!(
                        "openai api error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(format!("openai request failed: {}", e));
                    continue;
                }
            }
        }

        Err(ThreatScopeError::EmbeddingUnavailable(
            last_err.unwrap_or_else(|| "embedding failed after retries".to_string()),
        ))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self.embed_batch(batch).await?;
            if vectors.len() != batch.len() {
                return Err(ThreatScopeError::EmbeddingUnavailable(format!(
                    "openai returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            check_dims(self.dims, &vectors)?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json.get("data").and_then(|d| d.as_array()).ok_or_else(|| {
        ThreatScopeError::EmbeddingUnavailable("openai response missing data array".to_string())
    })?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                ThreatScopeError::EmbeddingUnavailable(
                    "openai response missing embedding".to_string(),
                )
            })?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }

    Ok(embeddings)
}

// ============ Ollama ============

/// Local Ollama instance, `POST {url}/api/embed`. Needs an embedding
/// model pulled, e.g. `ollama pull nomic-embed-text`.
pub struct OllamaProvider {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
    batch_size: usize,
    max_retries: u32,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model: require_model(config)?,
            dims: require_dims(config)?,
            url,
            client: build_client(config.timeout_secs)?,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err: Option<String> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                debug!(attempt, delay_secs = delay.as_secs(), "retrying ollama embed");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/api/embed", self.url))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            ThreatScopeError::EmbeddingUnavailable(format!(
                                "ollama response body: {}",
                                e
                            ))
                        })?;
                        return parse_ollama_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(format!("ollama api error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(ThreatScopeError::EmbeddingUnavailable(format!(
                        "ollama api error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(format!(
                        "ollama connection error (is Ollama running at {}?): {}",
                        self.url, e
                    ));
                    continue;
                }
            }
        }

        Err(ThreatScopeError::EmbeddingUnavailable(
            last_err.unwrap_or_else(|| "ollama embedding failed after retries".to_string()),
        ))
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self.embed_batch(batch).await?;
            if vectors.len() != batch.len() {
                return Err(ThreatScopeError::EmbeddingUnavailable(format!(
                    "ollama returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            check_dims(self.dims, &vectors)?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            ThreatScopeError::EmbeddingUnavailable(
                "ollama response missing embeddings array".to_string(),
            )
        })?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| {
                ThreatScopeError::EmbeddingUnavailable(
                    "ollama embedding is not an array".to_string(),
                )
            })?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }

    Ok(result)
}

// ============ Vector helpers ============

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
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

/// Cosine similarity in `[-1.0, 1.0]`. Returns `0.0` for empty vectors,
/// mismatched lengths, or a zero-magnitude vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let (mut dot, mut mag_a, mut mag_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot = x.mul_add(*y, dot);
        mag_a = x.mul_add(*x, mag_a);
        mag_b = y.mul_add(*y, mag_b);
    }

    let denom = (mag_a * mag_b).sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}
