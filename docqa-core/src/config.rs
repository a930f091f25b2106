//! Configuration system for docqa.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/docqa/config.toml` and/or `.docqa/config.toml`
//! in the workspace directory. Environment variables use the `DOCQA_` prefix with `__`
//! separating nested keys (`DOCQA_GATE__MAX_ITERATIONS=3`).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Top-level configuration for a docqa pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QaConfig {
    pub retrieval: RetrievalConfig,
    pub verification: VerificationConfig,
    pub gate: GateConfig,
    pub evaluation: EvaluationConfig,
    pub timeouts: TimeoutConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub corpus: CorpusConfig,
}

/// Hybrid retrieval tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Number of fused documents handed to generation.
    pub top_k: usize,
    /// Semantic candidates below this cosine similarity are dropped before fusion.
    pub similarity_floor: f32,
    /// Fraction of the fused score contributed by the lexical ranking, in [0, 1].
    pub lexical_weight: f64,
    /// RRF smoothing constant.
    pub rrf_k: f64,
    /// Each index is asked for `fetch_multiplier * top_k` candidates.
    pub fetch_multiplier: usize,
    /// Per-index lookup timeout.
    pub index_timeout_ms: u64,
    /// Expand broad questions into alternative phrasings before retrieval.
    pub query_expansion: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 20,
            similarity_floor: 0.3,
            lexical_weight: 0.4,
            rrf_k: 60.0,
            fetch_multiplier: 3,
            index_timeout_ms: 5_000,
            query_expansion: false,
        }
    }
}

/// Claim verification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// A claim is verified when any retrieved document reaches this similarity.
    pub threshold: f32,
    /// Documents retrieved per claim.
    pub top_k: usize,
    /// Supporting document ids recorded per claim.
    pub supporting_docs: usize,
    /// Maximum claims verified at the same time.
    pub concurrency: usize,
    pub claim_timeout_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            top_k: 5,
            supporting_docs: 2,
            concurrency: 4,
            claim_timeout_secs: 10,
        }
    }
}

/// Quality gate thresholds and iteration bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub quality_threshold: f64,
    pub accuracy_threshold: f64,
    /// Maximum number of generations per run, at least 1.
    pub max_iterations: u32,
    /// When set, a first iteration scoring at or above this is accepted immediately.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excellent_threshold: Option<f64>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 85.0,
            accuracy_threshold: 70.0,
            max_iterations: 1,
            excellent_threshold: None,
        }
    }
}

/// Dual-judge evaluation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Judges whose scores differ by less than this agree highly.
    pub agreement_delta: f64,
    pub judge_timeout_secs: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            agreement_delta: 10.0,
            judge_timeout_secs: 40,
        }
    }
}

/// Wall-clock budget per pipeline stage, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub embedding_secs: u64,
    pub expansion_secs: u64,
    pub retrieval_secs: u64,
    pub generation_secs: u64,
    pub claims_secs: u64,
    pub verification_secs: u64,
    pub accuracy_secs: u64,
    pub evaluation_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            embedding_secs: 15,
            expansion_secs: 15,
            retrieval_secs: 10,
            generation_secs: 90,
            claims_secs: 45,
            verification_secs: 60,
            accuracy_secs: 60,
            evaluation_secs: 60,
        }
    }
}

/// Which embedder produces query and claim vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// "local" (deterministic hashing) or "openai".
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub api_key_env: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Cost per 1M input tokens (USD). Ignored by the local embedder.
    pub cost_per_million: f64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 384,
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            cost_per_million: 0.02,
        }
    }
}

/// Connection and sampling settings for one model role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider name: "openai", "anthropic", "mock".
    pub provider: String,
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub max_tokens: usize,
    pub temperature: f32,
}

impl ModelConfig {
    pub fn openai(model: &str, max_tokens: usize, temperature: f32) -> Self {
        Self {
            provider: "openai".to_string(),
            model: model.to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            max_tokens,
            temperature,
        }
    }

    pub fn anthropic(model: &str, max_tokens: usize, temperature: f32) -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: model.to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: None,
            max_tokens,
            temperature,
        }
    }
}

/// Per-role model configuration plus retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub answer: ModelConfig,
    pub claims: ModelConfig,
    pub accuracy: ModelConfig,
    pub judge_primary: ModelConfig,
    pub judge_secondary: ModelConfig,
    pub expansion: ModelConfig,
    pub retry: RetryConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            answer: ModelConfig::anthropic("claude-sonnet-4-5-20250929", 2000, 0.3),
            claims: ModelConfig::openai("gpt-4o-mini", 4000, 0.1),
            accuracy: ModelConfig::anthropic("claude-sonnet-4-20250514", 1500, 0.0),
            judge_primary: ModelConfig::openai("gpt-4o-mini", 500, 0.1),
            judge_secondary: ModelConfig::anthropic("claude-sonnet-4-20250514", 500, 0.1),
            expansion: ModelConfig::openai("gpt-4o-mini", 300, 0.3),
            retry: RetryConfig::default(),
        }
    }
}

/// Exponential backoff policy for transient provider errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Where the prepared corpus lives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl QaConfig {
    /// Reject out-of-range values before a pipeline is assembled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.retrieval;
        if !(0.0..=1.0).contains(&r.lexical_weight) || r.lexical_weight.is_nan() {
            return Err(invalid(format!(
                "retrieval.lexical_weight must be within [0, 1], got {}",
                r.lexical_weight
            )));
        }
        if r.top_k == 0 {
            return Err(invalid("retrieval.top_k must be at least 1"));
        }
        if r.fetch_multiplier == 0 {
            return Err(invalid("retrieval.fetch_multiplier must be at least 1"));
        }
        if r.rrf_k <= 0.0 {
            return Err(invalid(format!("retrieval.rrf_k must be positive, got {}", r.rrf_k)));
        }

        let v = &self.verification;
        if v.top_k == 0 {
            return Err(invalid("verification.top_k must be at least 1"));
        }
        if v.concurrency == 0 {
            return Err(invalid("verification.concurrency must be at least 1"));
        }
        if !(0.0..=1.0).contains(&v.threshold) {
            return Err(invalid(format!(
                "verification.threshold must be within [0, 1], got {}",
                v.threshold
            )));
        }

        let g = &self.gate;
        if g.max_iterations == 0 {
            return Err(invalid("gate.max_iterations must be at least 1"));
        }
        for (name, value) in [
            ("gate.quality_threshold", Some(g.quality_threshold)),
            ("gate.accuracy_threshold", Some(g.accuracy_threshold)),
            ("gate.excellent_threshold", g.excellent_threshold),
        ] {
            if let Some(value) = value
                && !(0.0..=100.0).contains(&value)
            {
                return Err(invalid(format!("{name} must be within [0, 100], got {value}")));
            }
        }
        if let Some(excellent) = g.excellent_threshold
            && excellent < g.quality_threshold
        {
            return Err(invalid(format!(
                "gate.excellent_threshold ({excellent}) must not be below gate.quality_threshold ({})",
                g.quality_threshold
            )));
        }

        if self.evaluation.agreement_delta < 0.0 {
            return Err(invalid("evaluation.agreement_delta must not be negative"));
        }

        for (role, model) in self.llm.roles() {
            if model.model.trim().is_empty() {
                return Err(ConfigError::MissingField {
                    field: format!("llm.{role}.model"),
                });
            }
        }

        Ok(())
    }
}

impl LlmConfig {
    /// Every configured role with its key name.
    pub fn roles(&self) -> [(&'static str, &ModelConfig); 6] {
        [
            ("answer", &self.answer),
            ("claims", &self.claims),
            ("accuracy", &self.accuracy),
            ("judge_primary", &self.judge_primary),
            ("judge_secondary", &self.judge_secondary),
            ("expansion", &self.expansion),
        ]
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

/// Load configuration from all layers (defaults -> user config -> workspace config -> env).
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&QaConfig>,
) -> Result<QaConfig, ConfigError> {
    extract(figment(workspace, overrides, "DOCQA_"))
}

fn figment(workspace: Option<&Path>, overrides: Option<&QaConfig>, env_prefix: &str) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(QaConfig::default()));

    // User-level config
    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (DOCQA_RETRIEVAL__TOP_K, DOCQA_GATE__MAX_ITERATIONS, etc.)
    figment = figment.merge(Env::prefixed(env_prefix).split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment
}

fn extract(figment: Figment) -> Result<QaConfig, ConfigError> {
    figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}

/// Load a single TOML file on top of the defaults, ignoring other layers.
pub fn load_config_file(path: &Path) -> Result<QaConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    extract(Figment::from(Serialized::defaults(QaConfig::default())).merge(Toml::file(path)))
}

/// `~/.config/docqa/config.toml` on Linux, platform equivalent elsewhere.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "docqa", "docqa")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".docqa").join("config.toml")
}

/// Check whether any docqa configuration file exists (user-level or workspace-level).
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| workspace_config_path(ws).exists())
}
