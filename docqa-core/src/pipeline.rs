//! Pipeline orchestrator.
//!
//! Drives one question through embedding, optional expansion, hybrid
//! retrieval and the generate / verify / judge / gate loop. Every stage runs
//! under its wall-clock budget, is recorded as a [`StageResult`] and is
//! reported through the run's [`ProgressEmitter`]. A run always produces a
//! [`PipelineRun`]; failures are captured on it instead of being returned.

use crate::accuracy::{AccuracyJudge, AccuracyRequest, LlmAccuracyJudge};
use crate::brain::Brain;
use crate::claims::{ClaimExtractor, ClaimsPipeline, LlmClaimExtractor};
use crate::config::{ModelConfig, QaConfig};
use crate::corpus::Corpus;
use crate::embeddings::{Embedder, create_embedder};
use crate::error::{ConfigError, LlmError, QaError, StageError};
use crate::evaluation::{DualEvaluator, EvaluationRequest, LlmQualityJudge, QualityJudge};
use crate::expansion::{
    LlmQueryExpander, QueryExpander, anchor_similarity, merge_results, should_expand_query,
};
use crate::gate::{GateState, best_iteration};
use crate::generation::{AnswerGenerator, GenerationRequest, LlmAnswerGenerator};
use crate::progress::{NoopSink, ProgressEmitter, ProgressSink, ProgressStatus};
use crate::providers::create_provider;
use crate::retrieval::{RetrievalOutcome, RetrievalRequest, RetrievalStage};
use crate::run::{FailureKind, IterationEvaluation, PipelineRun, RunStatus, StageResult};
use crate::search::{LexicalIndex, VectorIndex};
use crate::stage::{Stage, within_budget};
use crate::types::{FusedResult, TokenUsage};
use futures::future::join_all;
use serde_json::{Map, Value, json};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Stages run once per question before the iteration loop.
const PRE_LOOP_STAGES: usize = 2;

/// The assembled question-answering pipeline. Cheap to share behind an `Arc`;
/// concurrent runs do not interfere.
pub struct Pipeline {
    config: QaConfig,
    embedder: Arc<dyn Embedder>,
    retrieval: RetrievalStage,
    expander: Option<Arc<dyn QueryExpander>>,
    generator: Arc<dyn AnswerGenerator>,
    claims: ClaimsPipeline,
    accuracy: Arc<dyn AccuracyJudge>,
    evaluator: DualEvaluator,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("embedder", &self.embedder.provider_name())
            .field("query_expansion", &self.expander.is_some())
            .field("max_iterations", &self.config.gate.max_iterations)
            .finish()
    }
}

/// Builder wiring the pipeline's collaborators.
#[derive(Default)]
pub struct PipelineBuilder {
    config: Option<QaConfig>,
    embedder: Option<Arc<dyn Embedder>>,
    vector: Option<Arc<dyn VectorIndex>>,
    lexical: Option<Arc<dyn LexicalIndex>>,
    expander: Option<Arc<dyn QueryExpander>>,
    generator: Option<Arc<dyn AnswerGenerator>>,
    extractor: Option<Arc<dyn ClaimExtractor>>,
    accuracy: Option<Arc<dyn AccuracyJudge>>,
    primary_judge: Option<Arc<dyn QualityJudge>>,
    secondary_judge: Option<Arc<dyn QualityJudge>>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire the embedder and every model role from configuration.
    ///
    /// Indexes still have to be supplied, usually through [`Self::corpus`].
    pub fn from_config(config: QaConfig) -> Result<Self, QaError> {
        let llm = &config.llm;
        let brain = |model: &ModelConfig| -> Result<Brain, LlmError> {
            Ok(Brain::for_role(create_provider(model)?, model, &llm.retry))
        };

        let mut builder = Self::new()
            .embedder(create_embedder(&config.embedding)?)
            .answer_generator(Arc::new(LlmAnswerGenerator::new(brain(&llm.answer)?)))
            .claim_extractor(Arc::new(LlmClaimExtractor::new(brain(&llm.claims)?)))
            .accuracy_judge(Arc::new(LlmAccuracyJudge::new(brain(&llm.accuracy)?)))
            .judges(
                Arc::new(LlmQualityJudge::new(brain(&llm.judge_primary)?)),
                Arc::new(LlmQualityJudge::new(brain(&llm.judge_secondary)?)),
            );
        if config.retrieval.query_expansion {
            builder =
                builder.query_expander(Arc::new(LlmQueryExpander::new(brain(&llm.expansion)?)));
        }
        Ok(builder.config(config))
    }

    pub fn config(mut self, config: QaConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn vector_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.vector = Some(index);
        self
    }

    pub fn lexical_index(mut self, index: Arc<dyn LexicalIndex>) -> Self {
        self.lexical = Some(index);
        self
    }

    /// Use both indexes of a loaded corpus.
    pub fn corpus(self, corpus: &Corpus) -> Self {
        self.vector_index(corpus.vector_index())
            .lexical_index(corpus.lexical_index())
    }

    pub fn query_expander(mut self, expander: Arc<dyn QueryExpander>) -> Self {
        self.expander = Some(expander);
        self
    }

    pub fn answer_generator(mut self, generator: Arc<dyn AnswerGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn claim_extractor(mut self, extractor: Arc<dyn ClaimExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn accuracy_judge(mut self, judge: Arc<dyn AccuracyJudge>) -> Self {
        self.accuracy = Some(judge);
        self
    }

    pub fn judges(mut self, primary: Arc<dyn QualityJudge>, secondary: Arc<dyn QualityJudge>) -> Self {
        self.primary_judge = Some(primary);
        self.secondary_judge = Some(secondary);
        self
    }

    /// Validate the configuration and assemble the pipeline.
    pub fn build(self) -> Result<Pipeline, ConfigError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let embedder = required(self.embedder, "embedder")?;
        let vector = required(self.vector, "vector_index")?;
        let lexical = required(self.lexical, "lexical_index")?;
        let generator = required(self.generator, "answer_generator")?;
        let extractor = required(self.extractor, "claim_extractor")?;
        let accuracy = required(self.accuracy, "accuracy_judge")?;
        let primary = required(self.primary_judge, "primary_judge")?;
        let secondary = required(self.secondary_judge, "secondary_judge")?;
        let expander = if config.retrieval.query_expansion {
            Some(required(self.expander, "query_expander")?)
        } else {
            None
        };

        let retrieval = RetrievalStage::new(vector, lexical, &config.retrieval);
        let claims = ClaimsPipeline::new(
            extractor,
            Arc::clone(&embedder),
            retrieval.clone(),
            config.verification.clone(),
            config.retrieval.similarity_floor,
        );
        let evaluator = DualEvaluator::new(
            primary,
            secondary,
            Duration::from_secs(config.evaluation.judge_timeout_secs),
            config.evaluation.agreement_delta,
        );

        info!(
            embedder = embedder.provider_name(),
            top_k = config.retrieval.top_k,
            max_iterations = config.gate.max_iterations,
            query_expansion = expander.is_some(),
            "Pipeline assembled"
        );

        Ok(Pipeline {
            config,
            embedder,
            retrieval,
            expander,
            generator,
            claims,
            accuracy,
            evaluator,
        })
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, ConfigError> {
    value.ok_or_else(|| ConfigError::MissingField {
        field: field.to_string(),
    })
}

/// How the loop ended when it did not fail.
enum Verdict {
    Accepted(u32),
    Exhausted(u32),
}

/// Why the loop stopped early.
enum Halt {
    /// The question could not be embedded or retrieved for.
    Fatal(StageError),
    /// A stage inside the iteration loop failed or timed out.
    Stage(StageError),
}

impl Halt {
    fn into_parts(self) -> (FailureKind, StageError) {
        match self {
            Halt::Fatal(e @ StageError::Cancelled { .. })
            | Halt::Stage(e @ StageError::Cancelled { .. }) => (FailureKind::Cancelled, e),
            Halt::Fatal(e) => (FailureKind::Fatal, e),
            Halt::Stage(e) => (FailureKind::StageFailed, e),
        }
    }
}

/// An entered stage, awaiting its exit record.
struct StageTimer {
    label: String,
    iteration: Option<u32>,
    started: Instant,
}

impl StageTimer {
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn succeeded(&self) -> StageResult {
        StageResult::succeeded(self.label.clone(), self.iteration, self.elapsed_ms())
    }
}

/// Mutable state threaded through one run.
struct RunContext {
    run: PipelineRun,
    emitter: ProgressEmitter,
    cancel: CancellationToken,
    clock: Instant,
}

impl RunContext {
    /// Enter a stage, unless the run has been cancelled.
    fn begin(&self, stage: Stage, iteration: Option<u32>) -> Result<StageTimer, StageError> {
        let label = stage.label(iteration);
        if self.cancel.is_cancelled() {
            info!(run_id = %self.run.id, stage = %label, "Run cancelled before stage");
            return Err(StageError::Cancelled { stage: label });
        }
        debug!(run_id = %self.run.id, stage = %label, "Stage started");
        self.emitter
            .stage_started(&label, stage.describe(), self.run.total_cost_usd);
        Ok(StageTimer {
            label,
            iteration,
            started: Instant::now(),
        })
    }

    /// Record a successful (possibly degraded) stage exit.
    fn complete(&mut self, result: StageResult, message: impl Into<String>) {
        let label = result.stage.clone();
        let duration_ms = result.duration_ms;
        let status = if result.degraded {
            warn!(
                run_id = %self.run.id,
                stage = %label,
                duration_ms,
                error = result.error.as_deref().unwrap_or_default(),
                "Stage degraded"
            );
            ProgressStatus::Degraded
        } else {
            info!(
                run_id = %self.run.id,
                stage = %label,
                duration_ms,
                cost_usd = result.cost_usd,
                "Stage completed"
            );
            ProgressStatus::Completed
        };
        self.run.record_stage(result);
        self.emitter
            .stage_finished(&label, status, message, self.run.total_cost_usd, duration_ms);
    }

    fn fail(&mut self, timer: &StageTimer, err: &StageError) {
        let duration_ms = timer.elapsed_ms();
        error!(run_id = %self.run.id, stage = %timer.label, duration_ms, error = %err, "Stage failed");
        self.run.record_stage(StageResult::failed(
            timer.label.clone(),
            timer.iteration,
            duration_ms,
            err.to_string(),
        ));
        self.emitter.stage_finished(
            &timer.label,
            ProgressStatus::Failed,
            err.to_string(),
            self.run.total_cost_usd,
            duration_ms,
        );
    }
}

/// Retrieval across the question and its variations.
struct Gathered {
    results: Vec<FusedResult>,
    primary: RetrievalOutcome,
    queries: usize,
    failed_variations: Vec<String>,
    usage: TokenUsage,
    cost_usd: f64,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn config(&self) -> &QaConfig {
        &self.config
    }

    /// Answer a question without observing progress.
    pub async fn answer(&self, question: &str) -> PipelineRun {
        self.answer_with_progress(question, Arc::new(NoopSink), CancellationToken::new())
            .await
    }

    /// Answer a question, reporting every stage to `sink`.
    ///
    /// Cancelling `cancel` silences the sink immediately and stops the run at
    /// the next stage boundary.
    pub async fn answer_with_progress(
        &self,
        question: &str,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> PipelineRun {
        let run = PipelineRun::new(question);
        let emitter = ProgressEmitter::new(sink, cancel.clone(), run.id, self.planned_steps(question));
        let mut ctx = RunContext {
            run,
            emitter,
            cancel,
            clock: Instant::now(),
        };

        info!(
            run_id = %ctx.run.id,
            question_len = question.len(),
            max_iterations = self.config.gate.max_iterations,
            "Pipeline run started"
        );
        let outcome = self.drive(&mut ctx).await;
        self.settle(ctx, outcome)
    }

    fn planned_steps(&self, question: &str) -> usize {
        let expansion = usize::from(self.expands(question));
        PRE_LOOP_STAGES + expansion + Stage::ITERATION.len() * self.config.gate.max_iterations as usize
    }

    fn expands(&self, question: &str) -> bool {
        self.expander.is_some() && should_expand_query(question)
    }

    async fn drive(&self, ctx: &mut RunContext) -> Result<Verdict, Halt> {
        let embedding = self.embed_question(ctx).await.map_err(Halt::Fatal)?;
        let sources = self
            .retrieve_sources(ctx, &embedding)
            .await
            .map_err(Halt::Fatal)?;
        ctx.run.sources = sources.clone();

        let mut state = GateState::start();
        let mut feedback: Option<String> = None;
        let mut iteration = 1;
        loop {
            ctx.run.iteration = iteration;
            self.run_iteration(ctx, iteration, feedback.as_deref(), &sources)
                .await
                .map_err(Halt::Stage)?;

            state = self.apply_gate(ctx, state, iteration).map_err(Halt::Stage)?;
            match &state {
                GateState::Accepted { iteration, .. } => return Ok(Verdict::Accepted(*iteration)),
                GateState::Exhausted { best_iteration } => {
                    return Ok(Verdict::Exhausted(*best_iteration));
                }
                GateState::Iterating { next, feedback: brief } => {
                    info!(run_id = %ctx.run.id, next = *next, "Quality gate requested another iteration");
                    feedback = Some(brief.clone());
                    iteration = *next;
                }
                GateState::Evaluating { .. } => {
                    return Err(Halt::Stage(StageError::failed(
                        Stage::QualityGate.label(Some(iteration)),
                        "gate made no decision",
                    )));
                }
            }
            state = state.begin_next();
        }
    }

    /// Await `work` under the stage's budget, recording a failed exit.
    async fn bounded<T, E, F>(
        &self,
        ctx: &mut RunContext,
        stage: Stage,
        timer: &StageTimer,
        work: F,
    ) -> Result<T, StageError>
    where
        E: Display,
        F: Future<Output = Result<T, E>>,
    {
        let outcome = match stage.budget(&self.config.timeouts) {
            Some(budget) => within_budget(&timer.label, budget, work).await,
            None => work.await.map_err(|e| StageError::failed(&timer.label, e)),
        };
        if let Err(e) = &outcome {
            ctx.fail(timer, e);
        }
        outcome
    }

    async fn embed_question(&self, ctx: &mut RunContext) -> Result<Vec<f32>, StageError> {
        let question = ctx.run.question.clone();
        let timer = ctx.begin(Stage::QuestionEmbedding, None)?;
        let embedding = self
            .bounded(ctx, Stage::QuestionEmbedding, &timer, self.embedder.embed(&question))
            .await?;

        let mut metadata = Map::new();
        metadata.insert("dimensions".into(), json!(embedding.vector.len()));
        metadata.insert("provider".into(), json!(self.embedder.provider_name()));
        ctx.complete(
            timer
                .succeeded()
                .with_cost(embedding.cost_usd, Some(embedding.usage))
                .with_metadata(metadata),
            format!("Embedded question ({} dimensions)", embedding.vector.len()),
        );
        Ok(embedding.vector)
    }

    /// Queries to retrieve with. Expansion never fails the run: on error the
    /// stage is recorded as degraded and the question is used alone.
    async fn expand(&self, ctx: &mut RunContext) -> Result<Vec<String>, StageError> {
        let question = ctx.run.question.clone();
        let Some(expander) = self.expander.as_ref() else {
            return Ok(vec![question]);
        };
        if !should_expand_query(&question) {
            debug!(run_id = %ctx.run.id, "Question is specific, skipping expansion");
            return Ok(vec![question]);
        }

        let timer = ctx.begin(Stage::QueryExpansion, None)?;
        let work = expander.expand(&question);
        let outcome = match Stage::QueryExpansion.budget(&self.config.timeouts) {
            Some(budget) => within_budget(&timer.label, budget, work).await,
            None => work.await.map_err(|e| StageError::failed(&timer.label, e)),
        };

        match outcome {
            Ok(expansion) => {
                let mut queries = vec![question.clone()];
                for query in expansion.queries {
                    if !queries.iter().any(|q| q.eq_ignore_ascii_case(&query)) {
                        queries.push(query);
                    }
                }
                let mut metadata = Map::new();
                metadata.insert("queries".into(), json!(queries));
                ctx.complete(
                    timer
                        .succeeded()
                        .with_cost(expansion.cost_usd, Some(expansion.usage))
                        .with_metadata(metadata),
                    format!("Retrieving with {} queries", queries.len()),
                );
                Ok(queries)
            }
            Err(e) => {
                ctx.complete(
                    timer.succeeded().degraded(e.to_string()),
                    "Expansion failed, using the original question",
                );
                Ok(vec![question])
            }
        }
    }

    async fn retrieve_sources(
        &self,
        ctx: &mut RunContext,
        embedding: &[f32],
    ) -> Result<Vec<FusedResult>, StageError> {
        let queries = self.expand(ctx).await?;
        let timer = ctx.begin(Stage::RagRetrieval, None)?;
        let gathered = self
            .bounded(
                ctx,
                Stage::RagRetrieval,
                &timer,
                self.gather(&queries, embedding),
            )
            .await?;

        let mut metadata = gathered.primary.metadata();
        metadata.insert("queries".into(), json!(gathered.queries));
        metadata.insert("documents".into(), json!(gathered.results.len()));
        if !gathered.failed_variations.is_empty() {
            metadata.insert("failed_variations".into(), json!(gathered.failed_variations));
        }

        let mut result = timer
            .succeeded()
            .with_cost(gathered.cost_usd, Some(gathered.usage))
            .with_metadata(metadata);
        if let Some(reason) = degradation(&gathered) {
            result = result.degraded(reason);
        }
        let message = if gathered.results.is_empty() {
            "No documentation matched the question".to_string()
        } else {
            format!("Retrieved {} documents", gathered.results.len())
        };
        ctx.complete(result, message);
        Ok(gathered.results)
    }

    /// Retrieve for the question, then for each variation concurrently.
    /// Only the question's own retrieval is required to succeed.
    async fn gather(&self, queries: &[String], question_embedding: &[f32]) -> Result<Gathered, QaError> {
        let top_k = self.config.retrieval.top_k;
        let floor = self.config.retrieval.similarity_floor;
        let (question, variations) = match queries.split_first() {
            Some((first, rest)) => (first.as_str(), rest),
            None => ("", &[][..]),
        };

        let primary = self
            .retrieval
            .retrieve(RetrievalRequest {
                query: question,
                embedding: question_embedding,
                top_k,
                similarity_floor: floor,
            })
            .await?;

        let mut gathered = Gathered {
            results: Vec::new(),
            primary,
            queries: queries.len().max(1),
            failed_variations: Vec::new(),
            usage: TokenUsage::default(),
            cost_usd: 0.0,
        };
        if variations.is_empty() {
            gathered.results = gathered.primary.results.clone();
            return Ok(gathered);
        }

        let lookups = variations.iter().map(|query| async move {
            let embedding = self.embedder.embed(query).await?;
            let outcome = self
                .retrieval
                .retrieve(RetrievalRequest {
                    query,
                    embedding: &embedding.vector,
                    top_k,
                    similarity_floor: floor,
                })
                .await?;
            Ok::<_, QaError>((embedding, outcome))
        });

        let mut lists = vec![gathered.primary.results.clone()];
        for (query, lookup) in variations.iter().zip(join_all(lookups).await) {
            match lookup {
                Ok((embedding, outcome)) => {
                    gathered.usage.accumulate(&embedding.usage);
                    gathered.cost_usd += embedding.cost_usd;
                    lists.push(outcome.results);
                }
                Err(e) => {
                    warn!(query = %query, error = %e, "Variation retrieval failed");
                    gathered.failed_variations.push(query.clone());
                }
            }
        }
        gathered.results = merge_results(lists, top_k);
        anchor_similarity(&mut gathered.results, question_embedding);
        Ok(gathered)
    }

    /// Run one iteration's stages. Whatever was produced is kept on the run,
    /// even when a stage fails part way.
    async fn run_iteration(
        &self,
        ctx: &mut RunContext,
        iteration: u32,
        feedback: Option<&str>,
        sources: &[FusedResult],
    ) -> Result<(), StageError> {
        let mut evaluation = IterationEvaluation::new(iteration, "");
        let outcome = self
            .score_iteration(ctx, &mut evaluation, feedback, sources)
            .await;
        if outcome.is_ok() || !evaluation.answer.is_empty() {
            ctx.run.evaluations.push(evaluation);
        }
        outcome
    }

    async fn score_iteration(
        &self,
        ctx: &mut RunContext,
        evaluation: &mut IterationEvaluation,
        feedback: Option<&str>,
        sources: &[FusedResult],
    ) -> Result<(), StageError> {
        let question = ctx.run.question.clone();
        let iteration = Some(evaluation.iteration);

        // Generation
        let timer = ctx.begin(Stage::AnswerGeneration, iteration)?;
        let request = GenerationRequest {
            question: &question,
            context: sources,
            feedback,
            iteration: evaluation.iteration,
        };
        let generation = self
            .bounded(ctx, Stage::AnswerGeneration, &timer, self.generator.generate(request))
            .await?;
        let mut metadata = Map::new();
        metadata.insert("model".into(), json!(generation.model));
        metadata.insert("answer_chars".into(), json!(generation.text.chars().count()));
        metadata.insert("revision".into(), json!(feedback.is_some()));
        let message = format!("Generated answer with {}", generation.model);
        ctx.complete(
            timer
                .succeeded()
                .with_cost(generation.cost_usd, Some(generation.usage))
                .with_metadata(metadata),
            message,
        );
        evaluation.answer = generation.text;

        // Claims
        let timer = ctx.begin(Stage::ClaimsExtraction, iteration)?;
        let extracted = self
            .bounded(
                ctx,
                Stage::ClaimsExtraction,
                &timer,
                self.claims.extract(&evaluation.answer),
            )
            .await?;
        let mut metadata = Map::new();
        metadata.insert("claims".into(), json!(extracted.claims.len()));
        ctx.complete(
            timer
                .succeeded()
                .with_cost(extracted.cost_usd, Some(extracted.usage))
                .with_metadata(metadata),
            format!("Extracted {} claims", extracted.claims.len()),
        );

        // Verification
        let timer = ctx.begin(Stage::ClaimsVerification, iteration)?;
        let verify = async { Ok::<_, std::convert::Infallible>(self.claims.verify(&extracted.claims).await) };
        let report = self
            .bounded(ctx, Stage::ClaimsVerification, &timer, verify)
            .await?;
        let mut metadata = Map::new();
        metadata.insert("verified".into(), json!(report.verified_count()));
        metadata.insert("total".into(), json!(report.claims.len()));
        metadata.insert("verification_rate".into(), json!(report.verification_rate()));
        metadata.insert("errored".into(), json!(report.errored_count()));
        let mut result = timer
            .succeeded()
            .with_cost(report.cost_usd, Some(report.usage))
            .with_metadata(metadata);
        if report.degraded() {
            result = result.degraded(format!("{} claims could not be checked", report.errored_count()));
        }
        ctx.complete(
            result,
            format!("{}/{} claims verified", report.verified_count(), report.claims.len()),
        );
        evaluation.claims = report.claims;

        // Accuracy
        let timer = ctx.begin(Stage::TechnicalAccuracy, iteration)?;
        let request = AccuracyRequest {
            question: &question,
            answer: &evaluation.answer,
            claims: &evaluation.claims,
        };
        let verdict = self
            .bounded(ctx, Stage::TechnicalAccuracy, &timer, self.accuracy.check(request))
            .await?;
        let mut metadata = Map::new();
        metadata.insert("accuracy_score".into(), json!(verdict.report.score));
        metadata.insert("errors".into(), json!(verdict.report.errors));
        metadata.insert("corrections".into(), json!(verdict.report.corrections.len()));
        let message = format!("Accuracy score {:.0}", verdict.report.score);
        ctx.complete(
            timer
                .succeeded()
                .with_cost(verdict.cost_usd, Some(verdict.usage))
                .with_metadata(metadata),
            message,
        );
        evaluation.accuracy = Some(verdict.report);

        // Judges
        let timer = ctx.begin(Stage::QualityEvaluation, iteration)?;
        let request = EvaluationRequest {
            question: &question,
            answer: &evaluation.answer,
            document_count: sources.len(),
            claims: &evaluation.claims,
            accuracy_score: evaluation.accuracy.as_ref().map(|a| a.score),
        };
        let dual = self
            .bounded(ctx, Stage::QualityEvaluation, &timer, self.evaluator.evaluate(request))
            .await?;
        let mut metadata = Map::new();
        metadata.insert("average_score".into(), json!(dual.average_score));
        metadata.insert("agreement".into(), json!(dual.agreement.to_string()));
        metadata.insert(
            "judges".into(),
            Value::Array(
                dual.results
                    .iter()
                    .map(|r| json!({ "judge": r.judge, "score": r.score }))
                    .collect(),
            ),
        );
        let mut result = timer
            .succeeded()
            .with_cost(dual.cost_usd, Some(dual.usage))
            .with_metadata(metadata);
        if dual.degraded() {
            let detail = dual
                .failed_judges
                .iter()
                .map(|(name, e)| format!("{name}: {e}"))
                .collect::<Vec<_>>()
                .join("; ");
            result = result.degraded(format!("judge failed ({detail})"));
        }
        ctx.complete(
            result,
            format!("Average score {:.1} ({} agreement)", dual.average_score, dual.agreement),
        );
        evaluation.average_score = Some(dual.average_score);
        evaluation.agreement = Some(dual.agreement);
        evaluation.failed_judges = dual.failed_judges.into_iter().map(|(name, _)| name).collect();
        evaluation.judges = dual.results;

        Ok(())
    }

    fn apply_gate(
        &self,
        ctx: &mut RunContext,
        state: GateState,
        iteration: u32,
    ) -> Result<GateState, StageError> {
        let timer = ctx.begin(Stage::QualityGate, Some(iteration))?;
        let next = state.observe(&self.config.gate, &ctx.run.evaluations);
        let reason = ctx
            .run
            .evaluations
            .last()
            .map(|current| next.reason(&self.config.gate, current))
            .unwrap_or_default();

        let mut metadata = Map::new();
        metadata.insert("decision".into(), json!(next.name()));
        metadata.insert("reason".into(), json!(reason));
        if let Some(current) = ctx.run.evaluations.last() {
            metadata.insert("quality_score".into(), json!(current.average_score));
            metadata.insert(
                "accuracy_score".into(),
                json!(current.accuracy.as_ref().map(|a| a.score)),
            );
        }
        info!(run_id = %ctx.run.id, iteration, decision = next.name(), reason = %reason, "Quality gate decided");
        ctx.complete(timer.succeeded().with_metadata(metadata), reason);
        Ok(next)
    }

    /// Fill in the run's outcome and emit the terminal event.
    fn settle(&self, mut ctx: RunContext, outcome: Result<Verdict, Halt>) -> PipelineRun {
        let (status, message) = match outcome {
            Ok(Verdict::Accepted(iteration)) => {
                adopt_iteration(&mut ctx.run, iteration);
                ctx.run.below_threshold = false;
                (RunStatus::Accepted, format!("Answer accepted on iteration {iteration}"))
            }
            Ok(Verdict::Exhausted(best)) => {
                adopt_iteration(&mut ctx.run, best);
                ctx.run.below_threshold = true;
                (
                    RunStatus::Exhausted,
                    format!("Returning best answer (iteration {best}) below threshold"),
                )
            }
            Err(halt) => {
                let (kind, err) = halt.into_parts();
                let best = best_iteration(&ctx.run.evaluations)
                    .or_else(|| ctx.run.evaluations.last())
                    .map(|e| e.iteration);
                if let Some(best) = best {
                    adopt_iteration(&mut ctx.run, best);
                }
                ctx.run.below_threshold = ctx.run.answer.is_some();
                ctx.run.fail(err.stage(), kind, err.to_string());
                (RunStatus::Failed, err.to_string())
            }
        };

        ctx.run.status = status;
        ctx.run.total_duration_ms = ctx.clock.elapsed().as_millis() as u64;
        ctx.emitter.finished(
            status,
            message,
            ctx.run.total_cost_usd,
            ctx.run.total_duration_ms,
        );

        info!(
            run_id = %ctx.run.id,
            status = %status,
            iterations = ctx.run.evaluations.len(),
            quality_score = ctx.run.quality_score,
            accuracy_score = ctx.run.accuracy_score,
            cost_usd = ctx.run.total_cost_usd,
            duration_ms = ctx.run.total_duration_ms,
            "Pipeline run finished"
        );
        ctx.run
    }
}

fn adopt_iteration(run: &mut PipelineRun, iteration: u32) {
    if let Some(evaluation) = run
        .evaluations
        .iter()
        .find(|e| e.iteration == iteration)
        .cloned()
    {
        run.adopt(&evaluation);
    }
}

fn degradation(gathered: &Gathered) -> Option<String> {
    let mut reasons = Vec::new();
    if let Some(e) = &gathered.primary.semantic_error {
        reasons.push(format!("semantic search failed: {e}"));
    }
    if let Some(e) = &gathered.primary.lexical_error {
        reasons.push(format!("lexical search failed: {e}"));
    }
    if !gathered.failed_variations.is_empty() {
        reasons.push(format!(
            "{} query variations failed",
            gathered.failed_variations.len()
        ));
    }
    (!reasons.is_empty()).then(|| reasons.join("; "))
}
