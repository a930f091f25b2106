//! Pluggable embedding providers.
//!
//! Provides the `Embedder` trait with two implementations:
//! - `LocalEmbedder`: deterministic hashing of term frequencies (always available)
//! - `OpenAiEmbedder`: OpenAI-compatible embeddings API over `reqwest`

use crate::config::EmbeddingConfig;
use crate::error::LlmError;
use crate::providers::models::per_token_rates;
use crate::types::TokenUsage;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A fixed-length vector with the accounting of the call that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

/// Trait for text embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text string.
    async fn embed(&self, text: &str) -> Result<Embedding, LlmError>;

    /// The dimensionality of the produced vectors.
    fn dimensions(&self) -> usize;

    fn provider_name(&self) -> &str;
}

/// Cosine similarity of two vectors; 0.0 for mismatched or zero-norm input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Hash-based local embedder (zero cost, no network).
///
/// Each lowercase alphanumeric term is hashed into a bucket weighted by its
/// frequency, then the vector is L2-normalized. Texts sharing vocabulary get
/// positive cosine similarity, which is all verification needs offline.
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dimensions: usize,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// Synchronous embedding, used when building a corpus.
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        let lowered = text.to_lowercase();
        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            *tf.entry(word).or_insert(0) += 1;
        }

        for (term, count) in &tf {
            let idx = djb2(term) % self.dimensions;
            vector[idx] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

fn djb2(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, LlmError> {
        Ok(Embedding {
            vector: self.embed_text(text),
            usage: TokenUsage::new(estimate_tokens(text), 0),
            cost_usd: 0.0,
        })
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "local"
    }
}

fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// OpenAI-compatible embeddings API client.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    base_url: String,
    cost_per_token: f64,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Self {
        let table_rate = per_token_rates(&config.model).0;
        let cost_per_token = if table_rate > 0.0 {
            table_rate
        } else {
            config.cost_per_million / 1_000_000.0
        };
        Self {
            client: reqwest::Client::new(),
            api_key,
            model: config.model.clone(),
            dims: config.dimensions,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".into())
                .trim_end_matches('/')
                .to_string(),
            cost_per_token,
        }
    }

    fn parse_response(&self, json: &Value, text: &str) -> Result<Embedding, LlmError> {
        let vector: Vec<f32> = json["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| LlmError::ResponseParse {
                message: "Missing data[0].embedding in embeddings response".to_string(),
            })?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        if vector.is_empty() {
            return Err(LlmError::ResponseParse {
                message: "Empty embedding vector".to_string(),
            });
        }

        let input_tokens = json["usage"]["prompt_tokens"]
            .as_u64()
            .map(|t| t as usize)
            .unwrap_or_else(|| estimate_tokens(text));

        Ok(Embedding {
            vector,
            usage: TokenUsage::new(input_tokens, 0),
            cost_usd: input_tokens as f64 * self.cost_per_token,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, LlmError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "dimensions": self.dims,
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Connection {
                message: format!("Embedding request failed: {e}"),
            })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited {
                retry_after_secs: 5,
            });
        }
        if status.as_u16() == 401 {
            return Err(LlmError::AuthFailed {
                provider: "openai embeddings".to_string(),
            });
        }
        let json: Value = resp.json().await.map_err(|e| LlmError::ResponseParse {
            message: format!("Invalid embeddings JSON: {e}"),
        })?;
        if !status.is_success() {
            return Err(LlmError::ApiRequest {
                message: format!("Embeddings HTTP {status}: {json}"),
            });
        }

        self.parse_response(&json, text)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_name(&self) -> &str {
        "openai"
    }
}

/// Create an embedder from configuration.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, LlmError> {
    match config.provider.to_lowercase().as_str() {
        "local" => Ok(Arc::new(LocalEmbedder::new(config.dimensions))),
        "openai" => {
            let api_key =
                std::env::var(&config.api_key_env).map_err(|_| LlmError::AuthFailed {
                    provider: format!("openai embeddings (env var '{}' not set)", config.api_key_env),
                })?;
            Ok(Arc::new(OpenAiEmbedder::new(config, api_key)))
        }
        other => Err(LlmError::UnknownProvider {
            kind: other.to_string(),
        }),
    }
}
