//! Error types for the docqa core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering LLM calls, search backends, configuration and pipeline stages.

use std::path::PathBuf;

/// Top-level error type for the docqa core library.
#[derive(Debug, thiserror::Error)]
pub enum QaError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from LLM and embedding provider interactions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Unknown provider kind: {kind}")]
    UnknownProvider { kind: String },
}

/// Errors from the lexical and vector indexes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SearchError {
    #[error("Index error: {0}")]
    IndexError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{source_name} search timed out after {timeout_ms}ms")]
    Timeout { source_name: String, timeout_ms: u64 },

    #[error("All retrieval sources failed (semantic: {semantic}; lexical: {lexical})")]
    AllSourcesFailed { semantic: String, lexical: String },

    #[error("Corpus error: {0}")]
    Corpus(String),
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors raised while running a single pipeline stage.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StageError {
    #[error("Stage '{stage}' failed: {message}")]
    Failed { stage: String, message: String },

    #[error("Stage '{stage}' timed out after {timeout_ms}ms")]
    Timeout { stage: String, timeout_ms: u64 },

    #[error("Run was cancelled during stage '{stage}'")]
    Cancelled { stage: String },
}

impl StageError {
    pub fn failed(stage: impl Into<String>, message: impl ToString) -> Self {
        Self::Failed {
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    pub fn stage(&self) -> &str {
        match self {
            Self::Failed { stage, .. } | Self::Timeout { stage, .. } | Self::Cancelled { stage } => {
                stage
            }
        }
    }
}

/// Errors from progress sinks. The orchestrator logs and ignores these.
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("Progress receiver closed")]
    Closed,

    #[error("Progress sink error: {0}")]
    Sink(String),
}

/// A type alias for results using the top-level `QaError`.
pub type Result<T> = std::result::Result<T, QaError>;
