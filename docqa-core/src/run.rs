//! The run aggregate: everything one question produced.

use crate::types::{AgreementLevel, Claim, EvaluationResult, FusedResult, TokenUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Both gates passed.
    Accepted,
    /// Iteration budget spent; the best iteration is returned below threshold.
    Exhausted,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Accepted => write!(f, "accepted"),
            RunStatus::Exhausted => write!(f, "exhausted"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A stage failed or timed out; the iteration was abandoned.
    StageFailed,
    /// A stage with no fallback failed before any answer existed.
    Fatal,
    Cancelled,
}

/// Why a run ended as `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Record of one stage execution. Appended, never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage label, tagged with the iteration for looping stages.
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    pub success: bool,
    pub degraded: bool,
    pub duration_ms: u64,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StageResult {
    pub fn succeeded(stage: impl Into<String>, iteration: Option<u32>, duration_ms: u64) -> Self {
        let mut metadata = Map::new();
        if let Some(iteration) = iteration {
            metadata.insert("iteration".into(), Value::from(iteration));
        }
        Self {
            stage: stage.into(),
            iteration,
            success: true,
            degraded: false,
            duration_ms,
            cost_usd: 0.0,
            tokens: None,
            error: None,
            metadata,
        }
    }

    pub fn failed(
        stage: impl Into<String>,
        iteration: Option<u32>,
        duration_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        let mut result = Self::succeeded(stage, iteration, duration_ms);
        result.success = false;
        result.error = Some(error.into());
        result
    }

    pub fn with_cost(mut self, cost_usd: f64, tokens: Option<TokenUsage>) -> Self {
        self.cost_usd = cost_usd;
        self.tokens = tokens;
        self
    }

    /// Mark as degraded, keeping the cause in `error`.
    pub fn degraded(mut self, reason: impl Into<String>) -> Self {
        self.degraded = true;
        self.error = Some(reason.into());
        self
    }

    /// Merge entries into the metadata map; `iteration` is never overwritten.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        for (key, value) in metadata {
            if key == "iteration" && self.iteration.is_some() {
                continue;
            }
            self.metadata.insert(key, value);
        }
        self
    }
}

/// Accuracy judge output kept on the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub score: f64,
    pub errors: Vec<String>,
    pub corrections: Vec<String>,
}

/// Everything observed about one generated answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationEvaluation {
    pub iteration: u32,
    pub answer: String,
    pub claims: Vec<Claim>,
    pub judges: Vec<EvaluationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement: Option<AgreementLevel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_judges: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<AccuracyReport>,
}

impl IterationEvaluation {
    pub fn new(iteration: u32, answer: impl Into<String>) -> Self {
        Self {
            iteration,
            answer: answer.into(),
            claims: Vec::new(),
            judges: Vec::new(),
            average_score: None,
            agreement: None,
            failed_judges: Vec::new(),
            accuracy: None,
        }
    }

    /// True once both the quality and the accuracy scores exist.
    pub fn is_scored(&self) -> bool {
        self.average_score.is_some() && self.accuracy.is_some()
    }
}

/// Aggregate root of one question's run.
///
/// Owned by the orchestrator while the run is live and handed to the caller
/// whole, whether the run succeeded or not.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub question: String,
    /// Number of generations attempted.
    pub iteration: u32,
    /// Answer returned to the caller: the accepted or best-scoring one.
    pub answer: Option<String>,
    pub sources: Vec<FusedResult>,
    /// Claims of the returned answer.
    pub claims: Vec<Claim>,
    pub evaluations: Vec<IterationEvaluation>,
    pub stages: Vec<StageResult>,
    pub total_cost_usd: f64,
    pub total_duration_ms: u64,
    pub quality_score: Option<f64>,
    pub accuracy_score: Option<f64>,
    /// Reads `Failed` until the orchestrator settles the outcome.
    pub status: RunStatus,
    pub below_threshold: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            question: question.into(),
            iteration: 0,
            answer: None,
            sources: Vec::new(),
            claims: Vec::new(),
            evaluations: Vec::new(),
            stages: Vec::new(),
            total_cost_usd: 0.0,
            total_duration_ms: 0,
            quality_score: None,
            accuracy_score: None,
            status: RunStatus::Failed,
            below_threshold: false,
            failure: None,
            started_at: Utc::now(),
        }
    }

    /// Append a stage record and fold its cost into the run total.
    pub fn record_stage(&mut self, result: StageResult) {
        self.total_cost_usd += result.cost_usd;
        self.stages.push(result);
    }

    pub fn stage(&self, label: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == label)
    }

    /// Sum of recorded stage costs; equals `total_cost_usd`.
    pub fn stage_cost_sum(&self) -> f64 {
        self.stages.iter().map(|s| s.cost_usd).sum()
    }

    pub fn is_accepted(&self) -> bool {
        self.status == RunStatus::Accepted
    }

    /// Copy an iteration's outcome onto the run's top-level fields.
    pub fn adopt(&mut self, evaluation: &IterationEvaluation) {
        self.answer = Some(evaluation.answer.clone());
        self.claims = evaluation.claims.clone();
        self.quality_score = evaluation.average_score;
        self.accuracy_score = evaluation.accuracy.as_ref().map(|a| a.score);
    }

    pub fn fail(&mut self, stage: impl Into<String>, kind: FailureKind, message: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.failure = Some(RunFailure {
            stage: stage.into(),
            kind,
            message: message.into(),
        });
    }
}
