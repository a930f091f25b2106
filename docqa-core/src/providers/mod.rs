//! LLM provider implementations.
//!
//! Provides concrete implementations of the `LlmProvider` trait for:
//! - OpenAI-compatible APIs (OpenAI, Azure, Ollama, vLLM, LM Studio)
//! - Anthropic Messages API (Claude models)
//!
//! Use `create_provider()` to instantiate the appropriate provider for a model role.

pub mod anthropic;
pub mod models;
pub mod openai_compat;

use crate::brain::{LlmProvider, MockLlmProvider};
use crate::config::{ModelConfig, RetryConfig};
use crate::error::LlmError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use anthropic::AnthropicProvider;
pub use models::model_pricing;
pub use openai_compat::OpenAiCompatibleProvider;

/// Execute an async operation with exponential backoff retry on transient errors.
///
/// Retries on `LlmError::RateLimited` (respects `retry_after_secs`), `LlmError::Connection`
/// and `LlmError::Timeout`. Permanent errors (auth, parse) return immediately.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, LlmError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut last_err = None;
    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !is_retryable(&e) || attempt == config.max_retries {
                    return Err(e);
                }

                let backoff_ms = compute_backoff(config, attempt, &e);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| LlmError::Connection {
        message: "All retry attempts exhausted".to_string(),
    }))
}

/// Check if an error is retryable (transient).
pub fn is_retryable(err: &LlmError) -> bool {
    matches!(
        err,
        LlmError::RateLimited { .. } | LlmError::Connection { .. } | LlmError::Timeout { .. }
    )
}

/// Compute backoff delay, respecting rate limit retry-after hints.
fn compute_backoff(config: &RetryConfig, attempt: u32, err: &LlmError) -> u64 {
    let computed = compute_exponential_backoff(config, attempt);
    if let LlmError::RateLimited { retry_after_secs } = err {
        return (retry_after_secs * 1000).max(computed);
    }
    computed
}

fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    base.min(config.max_backoff_ms as f64) as u64
}

/// Create the provider for one model role.
///
/// `"mock"` yields a `MockLlmProvider` answering with a fixed string, which
/// keeps the CLI usable without credentials.
pub fn create_provider(config: &ModelConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.provider.to_lowercase().as_str() {
        "openai" | "openai-compatible" | "ollama" | "vllm" => {
            Ok(Arc::new(OpenAiCompatibleProvider::new(config)?))
        }
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(config)?)),
        "mock" => Ok(Arc::new(
            MockLlmProvider::with_response("No model is configured for this role.")
                .with_model(&config.model),
        )),
        other => Err(LlmError::UnknownProvider {
            kind: other.to_string(),
        }),
    }
}

/// Resolve the API key for a model role from its environment variable.
///
/// Local endpoints (localhost base URLs) do not need a key.
pub fn resolve_api_key(config: &ModelConfig) -> Result<String, LlmError> {
    if let Ok(key) = std::env::var(&config.api_key_env)
        && !key.trim().is_empty()
    {
        return Ok(key);
    }
    let is_local = config
        .base_url
        .as_deref()
        .is_some_and(|u| u.contains("localhost") || u.contains("127.0.0.1"));
    if is_local {
        return Ok("local".to_string());
    }
    Err(LlmError::AuthFailed {
        provider: format!("{} (env var '{}' not set)", config.provider, config.api_key_env),
    })
}
