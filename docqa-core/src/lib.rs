//! # docqa Core
//!
//! Core library for docqa, a grounded documentation assistant.
//! Provides hybrid retrieval with rank fusion, answer generation, claim
//! verification, dual-judge evaluation, the quality gate and the pipeline
//! orchestrator that ties them together.

pub mod accuracy;
pub mod brain;
pub mod claims;
pub mod config;
pub mod corpus;
pub mod embeddings;
pub mod error;
pub mod evaluation;
pub mod expansion;
pub mod fusion;
pub mod gate;
pub mod generation;
pub mod pipeline;
pub mod progress;
pub mod providers;
pub mod retrieval;
pub mod run;
pub mod search;
pub mod stage;
pub mod types;

// Re-export commonly used types at the crate root.
pub use brain::{Brain, LlmProvider, MockLlmProvider};
pub use config::{QaConfig, load_config};
pub use corpus::Corpus;
pub use embeddings::{Embedder, LocalEmbedder};
pub use error::{ConfigError, LlmError, QaError, Result, SearchError, StageError};
pub use fusion::RankFusion;
pub use gate::{AcceptReason, GateState};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use progress::{ChannelSink, NoopSink, ProgressEvent, ProgressSink, ProgressStatus, RecordingSink};
pub use retrieval::{RetrievalOutcome, RetrievalRequest, RetrievalStage};
pub use run::{FailureKind, IterationEvaluation, PipelineRun, RunStatus, StageResult};
pub use stage::Stage;
pub use types::{
    AgreementLevel, Claim, CriteriaScores, Document, EvaluationResult, FusedResult,
    RetrievalSource, TokenUsage,
};
