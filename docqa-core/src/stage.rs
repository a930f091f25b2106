//! Stage identities and the wall-clock budget every stage runs under.

use crate::config::TimeoutConfig;
use crate::error::StageError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// The pipeline's stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    QuestionEmbedding,
    QueryExpansion,
    RagRetrieval,
    AnswerGeneration,
    ClaimsExtraction,
    ClaimsVerification,
    TechnicalAccuracy,
    QualityEvaluation,
    QualityGate,
}

impl Stage {
    /// Stages repeated on every iteration.
    pub const ITERATION: [Stage; 6] = [
        Stage::AnswerGeneration,
        Stage::ClaimsExtraction,
        Stage::ClaimsVerification,
        Stage::TechnicalAccuracy,
        Stage::QualityEvaluation,
        Stage::QualityGate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::QuestionEmbedding => "question_embedding",
            Stage::QueryExpansion => "query_expansion",
            Stage::RagRetrieval => "rag_retrieval",
            Stage::AnswerGeneration => "answer_generation",
            Stage::ClaimsExtraction => "claims_extraction",
            Stage::ClaimsVerification => "claims_verification",
            Stage::TechnicalAccuracy => "technical_accuracy",
            Stage::QualityEvaluation => "quality_evaluation",
            Stage::QualityGate => "quality_gate",
        }
    }

    pub fn is_iterative(&self) -> bool {
        Self::ITERATION.contains(self)
    }

    /// Label recorded on stage results, e.g. `answer_generation_iter_2`.
    pub fn label(&self, iteration: Option<u32>) -> String {
        match iteration {
            Some(n) if self.is_iterative() => format!("{}_iter_{n}", self.as_str()),
            _ => self.as_str().to_string(),
        }
    }

    /// Human message for the stage's `Started` event.
    pub fn describe(&self) -> &'static str {
        match self {
            Stage::QuestionEmbedding => "Embedding question",
            Stage::QueryExpansion => "Expanding query",
            Stage::RagRetrieval => "Retrieving documentation",
            Stage::AnswerGeneration => "Generating answer",
            Stage::ClaimsExtraction => "Extracting claims",
            Stage::ClaimsVerification => "Verifying claims against documentation",
            Stage::TechnicalAccuracy => "Checking technical accuracy",
            Stage::QualityEvaluation => "Evaluating answer quality",
            Stage::QualityGate => "Applying quality gate",
        }
    }

    /// Wall-clock budget; the gate is pure and has none.
    pub fn budget(&self, timeouts: &TimeoutConfig) -> Option<Duration> {
        let secs = match self {
            Stage::QuestionEmbedding => timeouts.embedding_secs,
            Stage::QueryExpansion => timeouts.expansion_secs,
            Stage::RagRetrieval => timeouts.retrieval_secs,
            Stage::AnswerGeneration => timeouts.generation_secs,
            Stage::ClaimsExtraction => timeouts.claims_secs,
            Stage::ClaimsVerification => timeouts.verification_secs,
            Stage::TechnicalAccuracy => timeouts.accuracy_secs,
            Stage::QualityEvaluation => timeouts.evaluation_secs,
            Stage::QualityGate => return None,
        };
        Some(Duration::from_secs(secs))
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Await `work` under `budget`, folding both the timeout and the inner
/// error into a [`StageError`] labelled with `label`.
pub async fn within_budget<T, E, F>(label: &str, budget: Duration, work: F) -> Result<T, StageError>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(budget, work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(StageError::failed(label, e)),
        Err(_) => Err(StageError::Timeout {
            stage: label.to_string(),
            timeout_ms: budget.as_millis() as u64,
        }),
    }
}
