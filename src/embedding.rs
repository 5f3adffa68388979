//! Embedding provider abstraction and vector similarity.
//!
//! Defines the [`EmbeddingProvider`] trait and two implementations:
//! - **[`DisabledProvider`]** — returns errors; used when no API key is configured.
//! - **[`OpenAIProvider`]** — calls the OpenAI embeddings API.
//!
//! Also provides [`cosine_similarity`], the ranking function used by
//! retrieval.
//!
//! # Provider Selection
//!
//! Use [`create_provider`] to pick the provider from the configuration:
//!
//! ```rust,no_run
//! # use vaultforge::config::OpenAiConfig;
//! # use vaultforge::embedding::create_provider;
//! let provider = create_provider(&OpenAiConfig::default());
//! println!("embedding with {}", provider.model_name());
//! ```

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::config::OpenAiConfig;
use crate::openai::OpenAiClient;

/// Trait for embedding providers.
///
/// Implementations turn a batch of texts into vectors, one per *non-blank*
/// input, in input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query text.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let results = provider.embed(&[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Empty embedding response"))
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
///
/// Used when no OpenAI key is available. Indexing still works; entries are
/// stored without vectors and retrieval falls back to literal matches.
pub struct DisabledProvider {
    model: String,
}

impl DisabledProvider {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled (no OpenAI API key)")
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST {base_url}/embeddings`. Inputs are trimmed, blank inputs
/// dropped, and each input truncated to `max_input_chars` characters.
pub struct OpenAIProvider {
    client: OpenAiClient,
    model: String,
    max_input_chars: usize,
}

impl OpenAIProvider {
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        Ok(Self {
            client: OpenAiClient::from_config(config)?,
            model: config.embedding_model.clone(),
            max_input_chars: config.max_input_chars,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let inputs = clean_inputs(texts, self.max_input_chars);
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });

        let json = self.client.post_json("embeddings", &body).await?;
        parse_openai_response(&json)
    }
}

/// Trim, drop blanks, and truncate to `max_chars` characters.
fn clean_inputs(texts: &[String], max_chars: usize) -> Vec<String> {
    texts
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| match t.char_indices().nth(max_chars) {
            Some((cut, _)) => t[..cut].to_string(),
            None => t.to_string(),
        })
        .collect()
}

/// Parse the OpenAI embeddings API response JSON.
///
/// Extracts the `data[].embedding` arrays, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Create the embedding provider for the configuration.
///
/// Falls back to [`DisabledProvider`] (with a warning) when no API key is
/// available, so indexing can still run without network access.
pub fn create_provider(config: &OpenAiConfig) -> Box<dyn EmbeddingProvider> {
    match OpenAIProvider::new(config) {
        Ok(provider) => Box::new(provider),
        Err(e) => {
            warn!("Embeddings disabled: {}", e);
            Box::new(DisabledProvider::new(config.embedding_model.clone()))
        }
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero-magnitude vector.
///
/// # Formula
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
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

    (dot / denom).clamp(-1.0, 1.0)
}
