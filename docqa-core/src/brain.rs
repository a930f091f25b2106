//! LLM access layer.
//!
//! `LlmProvider` is the seam every generation, extraction and judging stage
//! goes through. `Brain` binds a provider to one role's sampling settings,
//! applies the retry policy and prices each call.

use crate::config::{ModelConfig, RetryConfig};
use crate::error::LlmError;
use crate::providers::with_retry;
use crate::types::TokenUsage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Role of a message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single text message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A request to the LLM for completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: Option<usize>,
    pub model: Option<String>,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            temperature: 0.7,
            max_tokens: None,
            model: None,
        }
    }
}

/// A completed response from the LLM.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub message: Message,
    pub usage: TokenUsage,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// Cost breakdown of a completion in USD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub input_cost: f64,
    pub output_cost: f64,
}

impl CostEstimate {
    pub fn from_usage(usage: &TokenUsage, rates: (f64, f64)) -> Self {
        Self {
            input_cost: usage.input_tokens as f64 * rates.0,
            output_cost: usage.output_tokens as f64 * rates.1,
        }
    }

    pub fn total(&self) -> f64 {
        self.input_cost + self.output_cost
    }
}

/// Trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Perform a full completion and return the response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Return the cost per token (input, output) in USD.
    fn cost_per_token(&self) -> (f64, f64);

    /// Return the model name.
    fn model_name(&self) -> &str;

    /// Rough token estimate (~4 chars per token).
    fn estimate_tokens(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| m.content.len() / 4).sum::<usize>() + 8 * messages.len()
    }
}

/// Text and accounting of one priced completion.
#[derive(Debug, Clone)]
pub struct BrainReply {
    pub text: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// A provider bound to one role's prompt settings.
///
/// Holds no mutable state so one `Brain` can serve concurrent calls.
#[derive(Clone)]
pub struct Brain {
    provider: Arc<dyn LlmProvider>,
    system_prompt: Option<String>,
    temperature: f32,
    max_tokens: Option<usize>,
    retry: RetryConfig,
}

impl Brain {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            system_prompt: None,
            temperature: 0.7,
            max_tokens: None,
            retry: RetryConfig::default(),
        }
    }

    /// Build from a role's model config, taking its sampling settings.
    pub fn for_role(provider: Arc<dyn LlmProvider>, model: &ModelConfig, retry: &RetryConfig) -> Self {
        Self {
            provider,
            system_prompt: None,
            temperature: model.temperature,
            max_tokens: Some(model.max_tokens),
            retry: retry.clone(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Send a single user prompt, retrying transient failures, and price the reply.
    pub async fn ask(&self, prompt: &str) -> Result<BrainReply, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(prompt));

        debug!(
            model = self.provider.model_name(),
            estimated_tokens = self.provider.estimate_tokens(&messages),
            "Sending completion request"
        );

        let response = with_retry(&self.retry, || {
            let request = CompletionRequest {
                messages: messages.clone(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                model: None,
            };
            self.provider.complete(request)
        })
        .await?;

        let cost = CostEstimate::from_usage(&response.usage, self.provider.cost_per_token());

        info!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            cost = format!("${:.4}", cost.total()),
            "Completion received"
        );

        Ok(BrainReply {
            text: response.message.content,
            usage: response.usage,
            cost_usd: cost.total(),
            model: response.model,
            finish_reason: response.finish_reason,
        })
    }
}

impl std::fmt::Debug for Brain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Brain")
            .field("model", &self.provider.model_name())
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// A mock LLM provider for testing.
///
/// Replies are served from a FIFO queue; once it is empty the fallback text
/// is returned. Every request is recorded for later inspection.
pub struct MockLlmProvider {
    model: String,
    rates: (f64, f64),
    responses: Mutex<VecDeque<Result<CompletionResponse, LlmError>>>,
    fallback: String,
    delay: Option<Duration>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            rates: (0.0, 0.0),
            responses: Mutex::new(VecDeque::new()),
            fallback: "I'm a mock LLM. No queued responses available.".to_string(),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create a MockLlmProvider that always returns the given text.
    pub fn with_response(text: &str) -> Self {
        let mut provider = Self::new();
        provider.fallback = text.to_string();
        provider
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Per-token (input, output) rates used for cost accounting.
    pub fn with_rates(mut self, input: f64, output: f64) -> Self {
        self.rates = (input, output);
        self
    }

    /// Sleep before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a response to be returned by the next `complete` call.
    pub fn queue_response(&self, response: CompletionResponse) {
        lock(&self.responses).push_back(Ok(response));
    }

    pub fn queue_text(&self, text: &str) {
        self.queue_response(Self::text_response(text));
    }

    /// Queue an error to be returned by the next `complete` call.
    pub fn queue_error(&self, error: LlmError) {
        lock(&self.responses).push_back(Err(error));
    }

    /// Create a simple text response for testing.
    pub fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            message: Message::assistant(text),
            usage: TokenUsage::new(100, 50),
            model: "mock-model".to_string(),
            finish_reason: Some("stop".to_string()),
        }
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// All requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        lock(&self.requests).push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = lock(&self.responses).pop_front();
        match next {
            Some(Ok(mut response)) => {
                response.model = self.model.clone();
                Ok(response)
            }
            Some(Err(e)) => Err(e),
            None => {
                let mut response = Self::text_response(&self.fallback);
                response.model = self.model.clone();
                Ok(response)
            }
        }
    }

    fn cost_per_token(&self) -> (f64, f64) {
        self.rates
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
