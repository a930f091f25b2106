//! Integration tests for the docqa pipeline.
//!
//! These tests drive full runs over a small in-memory corpus with scripted
//! collaborators, checking iteration bounds, degradation, failure capture,
//! cost accounting and the progress stream.

use async_trait::async_trait;
use docqa_core::accuracy::{AccuracyJudge, AccuracyRequest, AccuracyVerdict};
use docqa_core::claims::{ClaimExtractor, ExtractedClaims, split_sentences};
use docqa_core::config::{QaConfig, load_config};
use docqa_core::embeddings::{Embedder, Embedding, LocalEmbedder, cosine_similarity};
use docqa_core::error::{LlmError, SearchError};
use docqa_core::evaluation::{EvaluationRequest, JudgeVerdict, QualityJudge};
use docqa_core::expansion::{Expansion, QueryExpander};
use docqa_core::generation::{AnswerGenerator, Generation, GenerationRequest};
use docqa_core::run::AccuracyReport;
use docqa_core::search::LexicalIndex;
use docqa_core::types::{CriteriaScores, RetrievalCandidate};
use docqa_core::{
    AgreementLevel, Corpus, Document, FailureKind, Pipeline, PipelineBuilder, ProgressEvent,
    ProgressSink, ProgressStatus, RecordingSink, RunStatus, TokenUsage,
};
use docqa_core::error::ProgressError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const STAGE_COST: f64 = 0.01;

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

/// Returns queued answers in order, repeating the last one, and records
/// the feedback each request carried.
struct ScriptedGenerator {
    answers: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    feedback: Mutex<Vec<Option<String>>>,
    delay: Option<Duration>,
}

impl ScriptedGenerator {
    fn new(answers: &[&str]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            last: Mutex::new(String::new()),
            feedback: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn calls(&self) -> usize {
        self.feedback.lock().unwrap().len()
    }

    fn feedback(&self) -> Vec<Option<String>> {
        self.feedback.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnswerGenerator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<Generation, LlmError> {
        self.feedback
            .lock()
            .unwrap()
            .push(request.feedback.map(str::to_string));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let text = {
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.answers.lock().unwrap().pop_front() {
                *last = next;
            }
            last.clone()
        };
        Ok(Generation {
            text,
            usage: TokenUsage::new(200, 80),
            cost_usd: STAGE_COST,
            model: "scripted-writer".into(),
        })
    }
}

/// One claim per sentence.
struct SentenceExtractor;

#[async_trait]
impl ClaimExtractor for SentenceExtractor {
    async fn extract(&self, answer: &str) -> Result<ExtractedClaims, LlmError> {
        Ok(ExtractedClaims {
            claims: split_sentences(answer),
            usage: TokenUsage::new(50, 20),
            cost_usd: STAGE_COST,
        })
    }
}

/// Returns queued scores, repeating the last.
struct ScriptedAccuracy {
    scores: Mutex<VecDeque<f64>>,
    last: Mutex<f64>,
}

impl ScriptedAccuracy {
    fn new(scores: &[f64]) -> Self {
        Self {
            scores: Mutex::new(scores.iter().copied().collect()),
            last: Mutex::new(0.0),
        }
    }
}

#[async_trait]
impl AccuracyJudge for ScriptedAccuracy {
    async fn check(&self, _request: AccuracyRequest<'_>) -> Result<AccuracyVerdict, LlmError> {
        let score = {
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.scores.lock().unwrap().pop_front() {
                *last = next;
            }
            *last
        };
        Ok(AccuracyVerdict {
            report: AccuracyReport {
                score,
                errors: if score < 70.0 {
                    vec!["Mentions an undocumented plan".into()]
                } else {
                    Vec::new()
                },
                corrections: Vec::new(),
            },
            usage: TokenUsage::new(60, 30),
            cost_usd: STAGE_COST,
        })
    }
}

/// Returns queued outcomes, repeating the last. `None` is a failure.
struct ScriptedJudge {
    name: String,
    scores: Mutex<VecDeque<Option<f64>>>,
    last: Mutex<Option<f64>>,
}

impl ScriptedJudge {
    fn new(name: &str, scores: &[Option<f64>]) -> Self {
        Self {
            name: name.into(),
            scores: Mutex::new(scores.iter().copied().collect()),
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl QualityJudge for ScriptedJudge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, _request: EvaluationRequest<'_>) -> Result<JudgeVerdict, LlmError> {
        let outcome = {
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.scores.lock().unwrap().pop_front() {
                *last = next;
            }
            *last
        };
        let score = outcome.ok_or_else(|| LlmError::ApiRequest {
            message: format!("{} unavailable", self.name),
        })?;
        Ok(JudgeVerdict {
            result: docqa_core::EvaluationResult {
                judge: self.name.clone(),
                score,
                criteria: CriteriaScores {
                    technical_accuracy: score,
                    clarity: score,
                    completeness: score,
                    practical_value: score,
                },
                feedback: "Be more specific about retention.".into(),
            },
            usage: TokenUsage::new(120, 40),
            cost_usd: STAGE_COST,
        })
    }
}

struct ScriptedExpander {
    outcome: Result<Vec<String>, String>,
}

#[async_trait]
impl QueryExpander for ScriptedExpander {
    async fn expand(&self, question: &str) -> Result<Expansion, LlmError> {
        match &self.outcome {
            Ok(variations) => {
                let mut queries = vec![question.to_string()];
                queries.extend(variations.iter().cloned());
                Ok(Expansion {
                    queries,
                    usage: TokenUsage::new(40, 20),
                    cost_usd: STAGE_COST,
                })
            }
            Err(message) => Err(LlmError::Connection {
                message: message.clone(),
            }),
        }
    }
}

struct DownEmbedder;

#[async_trait]
impl Embedder for DownEmbedder {
    async fn embed(&self, _text: &str) -> Result<Embedding, LlmError> {
        Err(LlmError::Connection {
            message: "embedding service unreachable".into(),
        })
    }

    fn dimensions(&self) -> usize {
        64
    }

    fn provider_name(&self) -> &str {
        "down"
    }
}

struct DownLexicalIndex;

#[async_trait]
impl LexicalIndex for DownLexicalIndex {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<RetrievalCandidate>, SearchError> {
        Err(SearchError::IndexError("lexical index offline".into()))
    }
}

/// Cancels the run once it sees a given stage finish.
struct CancellingSink {
    events: RecordingSink,
    token: CancellationToken,
    trigger: String,
}

impl ProgressSink for CancellingSink {
    fn emit(&self, event: ProgressEvent) -> Result<(), ProgressError> {
        let fire = event.stage == self.trigger && event.status == ProgressStatus::Completed;
        self.events.emit(event)?;
        if fire {
            self.token.cancel();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const ANSWER: &str = "Postgres backups run daily. Backups are kept for seven days.";

async fn corpus() -> Corpus {
    let docs = vec![
        Document::new(
            "pg-backups",
            "Postgres backups",
            "https://docs.example.com/postgres/backups",
            "Postgres backups run daily. Backups are kept for seven days on paid plans.",
        )
        .with_section("Backups"),
        Document::new(
            "kv-plans",
            "Key Value plans",
            "https://docs.example.com/key-value/plans",
            "Key Value offers free and pro plans with different memory limits.",
        ),
        Document::new(
            "web-deploys",
            "Web service deploys",
            "https://docs.example.com/web/deploys",
            "Web services deploy automatically on every push to the linked branch.",
        ),
    ];
    Corpus::build(docs, &LocalEmbedder::new(64)).await.unwrap()
}

fn config(max_iterations: u32) -> QaConfig {
    let mut config = QaConfig::default();
    config.gate.max_iterations = max_iterations;
    config.gate.quality_threshold = 85.0;
    config.gate.accuracy_threshold = 70.0;
    config.retrieval.similarity_floor = 0.05;
    config
}

struct Harness {
    generator: Arc<ScriptedGenerator>,
    builder: PipelineBuilder,
}

async fn harness(
    config: QaConfig,
    generator: ScriptedGenerator,
    accuracy: &[f64],
    primary: &[Option<f64>],
    secondary: &[Option<f64>],
) -> Harness {
    let corpus = corpus().await;
    let generator = Arc::new(generator);
    let builder = Pipeline::builder()
        .config(config)
        .embedder(Arc::new(LocalEmbedder::new(64)))
        .corpus(&corpus)
        .answer_generator(generator.clone())
        .claim_extractor(Arc::new(SentenceExtractor))
        .accuracy_judge(Arc::new(ScriptedAccuracy::new(accuracy)))
        .judges(
            Arc::new(ScriptedJudge::new("judge-a", primary)),
            Arc::new(ScriptedJudge::new("judge-b", secondary)),
        );
    Harness { generator, builder }
}

fn labels(run: &docqa_core::PipelineRun) -> Vec<&str> {
    run.stages.iter().map(|s| s.stage.as_str()).collect()
}

const QUESTION: &str = "How often do Postgres backups run?";

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_accepted_on_first_iteration() {
    let h = harness(
        config(3),
        ScriptedGenerator::new(&[ANSWER]),
        &[95.0],
        &[Some(90.0)],
        &[Some(88.0)],
    )
    .await;
    let pipeline = h.builder.build().unwrap();
    let run = pipeline.answer(QUESTION).await;

    assert_eq!(run.status, RunStatus::Accepted);
    assert!(!run.below_threshold);
    assert!(run.failure.is_none());
    assert_eq!(run.answer.as_deref(), Some(ANSWER));
    assert_eq!(run.quality_score, Some(89.0));
    assert_eq!(run.accuracy_score, Some(95.0));
    assert_eq!(run.evaluations.len(), 1);
    assert_eq!(run.evaluations[0].agreement, Some(AgreementLevel::High));
    assert_eq!(h.generator.calls(), 1);

    assert_eq!(
        labels(&run),
        vec![
            "question_embedding",
            "rag_retrieval",
            "answer_generation_iter_1",
            "claims_extraction_iter_1",
            "claims_verification_iter_1",
            "technical_accuracy_iter_1",
            "quality_evaluation_iter_1",
            "quality_gate_iter_1",
        ]
    );
    assert!(run.stages.iter().all(|s| s.success));
    assert_eq!(run.stages[2].metadata["iteration"], 1);

    assert_eq!(run.sources[0].document.id, "pg-backups");
    assert_eq!(run.claims.len(), 2);
    assert!(run.claims.iter().all(|c| c.verification_error.is_none()));

    // generation + extraction + accuracy + two judges
    assert!((run.total_cost_usd - 5.0 * STAGE_COST).abs() < 1e-9);
    assert!((run.total_cost_usd - run.stage_cost_sum()).abs() < 1e-9);
}

#[tokio::test]
async fn test_failed_gate_feeds_back_into_next_generation() {
    let h = harness(
        config(3),
        ScriptedGenerator::new(&["Backups might be weekly.", ANSWER]),
        &[95.0],
        &[Some(60.0), Some(92.0)],
        &[Some(62.0), Some(90.0)],
    )
    .await;
    let pipeline = h.builder.build().unwrap();
    let run = pipeline.answer(QUESTION).await;

    assert_eq!(run.status, RunStatus::Accepted);
    assert_eq!(run.iteration, 2);
    assert_eq!(run.answer.as_deref(), Some(ANSWER));
    assert_eq!(run.quality_score, Some(91.0));

    let feedback = h.generator.feedback();
    assert_eq!(feedback.len(), 2);
    assert!(feedback[0].is_none());
    let brief = feedback[1].as_deref().unwrap();
    assert!(brief.contains("Quality Check Failed"));
    assert!(brief.contains("61.0/100"));

    let gate = run.stage("quality_gate_iter_1").unwrap();
    assert_eq!(gate.metadata["decision"], "iterating");
    assert!(run.stage("answer_generation_iter_2").is_some());
}

#[tokio::test]
async fn test_iterations_are_bounded_and_best_is_returned() {
    let h = harness(
        config(3),
        ScriptedGenerator::new(&["first draft", "second draft", "third draft"]),
        &[95.0],
        &[Some(50.0), Some(70.0), Some(60.0)],
        &[Some(50.0), Some(70.0), Some(60.0)],
    )
    .await;
    let pipeline = h.builder.build().unwrap();
    let run = pipeline.answer(QUESTION).await;

    assert_eq!(run.status, RunStatus::Exhausted);
    assert!(run.below_threshold);
    assert_eq!(h.generator.calls(), 3);
    assert_eq!(run.evaluations.len(), 3);
    assert_eq!(run.answer.as_deref(), Some("second draft"));
    assert_eq!(run.quality_score, Some(70.0));
    assert!(run.stage("answer_generation_iter_4").is_none());
    assert_eq!(
        run.stage("quality_gate_iter_3").unwrap().metadata["decision"],
        "exhausted"
    );
}

#[tokio::test]
async fn test_low_accuracy_blocks_acceptance() {
    let h = harness(
        config(2),
        ScriptedGenerator::new(&["There is a Platinum plan.", ANSWER]),
        &[30.0, 92.0],
        &[Some(95.0)],
        &[Some(95.0)],
    )
    .await;
    let pipeline = h.builder.build().unwrap();
    let run = pipeline.answer(QUESTION).await;

    assert_eq!(run.status, RunStatus::Accepted);
    assert_eq!(run.iteration, 2);
    let brief = h.generator.feedback()[1].clone().unwrap();
    assert!(brief.contains("Mentions an undocumented plan"));
}

#[tokio::test]
async fn test_single_judge_failure_degrades_evaluation() {
    let h = harness(
        config(1),
        ScriptedGenerator::new(&[ANSWER]),
        &[95.0],
        &[Some(90.0)],
        &[None],
    )
    .await;
    let (sink, events) = recording();
    let pipeline = h.builder.build().unwrap();
    let run = pipeline
        .answer_with_progress(QUESTION, sink, CancellationToken::new())
        .await;

    assert_eq!(run.status, RunStatus::Accepted);
    assert_eq!(run.quality_score, Some(90.0));
    let evaluation = &run.evaluations[0];
    assert_eq!(evaluation.agreement, Some(AgreementLevel::SingleRater));
    assert_eq!(evaluation.failed_judges, vec!["judge-b".to_string()]);

    let stage = run.stage("quality_evaluation_iter_1").unwrap();
    assert!(stage.success);
    assert!(stage.degraded);
    assert!(stage.error.as_deref().unwrap().contains("judge-b"));

    assert!(events.events().iter().any(|e| {
        e.stage == "quality_evaluation_iter_1" && e.status == ProgressStatus::Degraded
    }));
}

#[tokio::test]
async fn test_both_judges_failing_fails_the_run_but_keeps_the_answer() {
    let h = harness(
        config(2),
        ScriptedGenerator::new(&[ANSWER]),
        &[95.0],
        &[None],
        &[None],
    )
    .await;
    let pipeline = h.builder.build().unwrap();
    let run = pipeline.answer(QUESTION).await;

    assert_eq!(run.status, RunStatus::Failed);
    let failure = run.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::StageFailed);
    assert_eq!(failure.stage, "quality_evaluation_iter_1");
    assert_eq!(run.answer.as_deref(), Some(ANSWER));
    assert!(run.below_threshold);
    assert!(run.stage("quality_gate_iter_1").is_none());
    assert!(!run.stage("quality_evaluation_iter_1").unwrap().success);
}

#[tokio::test]
async fn test_stage_timeout_is_a_stage_failure() {
    let mut cfg = config(1);
    cfg.timeouts.generation_secs = 1;
    let h = harness(
        cfg,
        ScriptedGenerator::new(&[ANSWER]).with_delay(Duration::from_secs(5)),
        &[95.0],
        &[Some(90.0)],
        &[Some(90.0)],
    )
    .await;
    let pipeline = h.builder.build().unwrap();
    let run = pipeline.answer(QUESTION).await;

    assert_eq!(run.status, RunStatus::Failed);
    let failure = run.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::StageFailed);
    assert_eq!(failure.stage, "answer_generation_iter_1");
    assert!(failure.message.contains("timed out"));
    assert!(run.answer.is_none());
    assert!(run.total_duration_ms < 5_000);
}

#[tokio::test]
async fn test_embedding_failure_is_fatal() {
    let corpus = corpus().await;
    let generator = Arc::new(ScriptedGenerator::new(&[ANSWER]));
    let pipeline = Pipeline::builder()
        .config(config(3))
        .embedder(Arc::new(DownEmbedder))
        .corpus(&corpus)
        .answer_generator(generator.clone())
        .claim_extractor(Arc::new(SentenceExtractor))
        .accuracy_judge(Arc::new(ScriptedAccuracy::new(&[95.0])))
        .judges(
            Arc::new(ScriptedJudge::new("judge-a", &[Some(90.0)])),
            Arc::new(ScriptedJudge::new("judge-b", &[Some(90.0)])),
        )
        .build()
        .unwrap();

    let run = pipeline.answer(QUESTION).await;
    assert_eq!(run.status, RunStatus::Failed);
    let failure = run.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::Fatal);
    assert_eq!(failure.stage, "question_embedding");
    assert!(run.answer.is_none());
    assert!(!run.below_threshold);
    assert_eq!(generator.calls(), 0);
    assert_eq!(labels(&run), vec!["question_embedding"]);
    assert!(!run.stages[0].success);
}

#[tokio::test]
async fn test_lexical_outage_degrades_retrieval() {
    let corpus = corpus().await;
    let pipeline = Pipeline::builder()
        .config(config(1))
        .embedder(Arc::new(LocalEmbedder::new(64)))
        .vector_index(corpus.vector_index())
        .lexical_index(Arc::new(DownLexicalIndex))
        .answer_generator(Arc::new(ScriptedGenerator::new(&[ANSWER])))
        .claim_extractor(Arc::new(SentenceExtractor))
        .accuracy_judge(Arc::new(ScriptedAccuracy::new(&[95.0])))
        .judges(
            Arc::new(ScriptedJudge::new("judge-a", &[Some(90.0)])),
            Arc::new(ScriptedJudge::new("judge-b", &[Some(90.0)])),
        )
        .build()
        .unwrap();

    let run = pipeline.answer(QUESTION).await;
    assert_eq!(run.status, RunStatus::Accepted);

    let retrieval = run.stage("rag_retrieval").unwrap();
    assert!(retrieval.success);
    assert!(retrieval.degraded);
    assert_eq!(retrieval.metadata["single_source"], "semantic");
    assert!(!run.sources.is_empty());
    assert_eq!(run.sources[0].document.id, "pg-backups");
}

#[tokio::test]
async fn test_query_expansion_widens_retrieval() {
    let mut cfg = config(1);
    cfg.retrieval.query_expansion = true;
    let h = harness(
        cfg,
        ScriptedGenerator::new(&[ANSWER]),
        &[95.0],
        &[Some(90.0)],
        &[Some(90.0)],
    )
    .await;
    let expander = ScriptedExpander {
        outcome: Ok(vec![
            "Key Value free and pro plans".into(),
            "Web service deploy options".into(),
        ]),
    };
    let pipeline = h.builder.query_expander(Arc::new(expander)).build().unwrap();

    let run = pipeline.answer("Which database plans are available?").await;
    let expansion = run.stage("query_expansion").unwrap();
    assert!(!expansion.degraded);
    assert_eq!(expansion.metadata["queries"].as_array().unwrap().len(), 3);
    assert_eq!(run.stage("rag_retrieval").unwrap().metadata["queries"], 3);
    assert!(run.sources.iter().any(|s| s.document.id == "kv-plans"));
    assert_eq!(labels(&run)[1], "query_expansion");

    // similarity is reported against the question, not the variation that found it
    let question = LocalEmbedder::new(64).embed_text("Which database plans are available?");
    for source in &run.sources {
        let expected = cosine_similarity(&question, &source.document.embedding);
        assert!((source.similarity - expected).abs() < 1e-6, "{}", source.document.id);
    }
}

#[tokio::test]
async fn test_expansion_failure_falls_back_to_question() {
    let mut cfg = config(1);
    cfg.retrieval.query_expansion = true;
    let h = harness(
        cfg,
        ScriptedGenerator::new(&[ANSWER]),
        &[95.0],
        &[Some(90.0)],
        &[Some(90.0)],
    )
    .await;
    let expander = ScriptedExpander {
        outcome: Err("expansion model down".into()),
    };
    let pipeline = h.builder.query_expander(Arc::new(expander)).build().unwrap();

    let run = pipeline.answer("Which database plans are available?").await;
    assert_eq!(run.status, RunStatus::Accepted);
    let expansion = run.stage("query_expansion").unwrap();
    assert!(expansion.success);
    assert!(expansion.degraded);
    assert_eq!(run.stage("rag_retrieval").unwrap().metadata["queries"], 1);
}

#[tokio::test]
async fn test_specific_questions_skip_expansion() {
    let mut cfg = config(1);
    cfg.retrieval.query_expansion = true;
    let h = harness(
        cfg,
        ScriptedGenerator::new(&[ANSWER]),
        &[95.0],
        &[Some(90.0)],
        &[Some(90.0)],
    )
    .await;
    let expander = ScriptedExpander { outcome: Ok(vec![]) };
    let pipeline = h.builder.query_expander(Arc::new(expander)).build().unwrap();

    let run = pipeline.answer("How to restore a Postgres backup?").await;
    assert!(run.stage("query_expansion").is_none());
}

fn recording() -> (Arc<dyn ProgressSink>, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    (sink.clone(), sink)
}

#[tokio::test]
async fn test_progress_stream_is_ordered_with_one_terminal_event() {
    let h = harness(
        config(2),
        ScriptedGenerator::new(&["draft", ANSWER]),
        &[95.0],
        &[Some(60.0), Some(90.0)],
        &[Some(60.0), Some(90.0)],
    )
    .await;
    let (sink, recorder) = recording();
    let pipeline = h.builder.build().unwrap();
    let run = pipeline
        .answer_with_progress(QUESTION, sink, CancellationToken::new())
        .await;
    let events = recorder.events();

    assert!(events.iter().all(|e| e.run_id == run.id));
    assert_eq!(events[0].stage, "question_embedding");
    assert_eq!(events[0].status, ProgressStatus::Started);

    let finished: Vec<_> = events
        .iter()
        .filter(|e| e.status == ProgressStatus::Finished)
        .collect();
    assert_eq!(finished.len(), 1);
    let last = events.last().unwrap();
    assert_eq!(last.status, ProgressStatus::Finished);
    assert_eq!(last.outcome, Some(RunStatus::Accepted));
    assert_eq!(last.progress, 1.0);

    // every stage exit directly follows its own start
    for pair in events[..events.len() - 1].chunks(2) {
        assert_eq!(pair[0].status, ProgressStatus::Started);
        assert_ne!(pair[1].status, ProgressStatus::Started);
        assert_eq!(pair[0].stage, pair[1].stage);
    }

    for window in events.windows(2) {
        assert!(window[1].progress >= window[0].progress);
        assert!(window[1].cost_so_far >= window[0].cost_so_far);
    }
    assert_eq!(events.len(), 2 * run.stages.len() + 1);
}

#[tokio::test]
async fn test_cancellation_stops_the_run_and_the_stream() {
    let h = harness(
        config(3),
        ScriptedGenerator::new(&[ANSWER]),
        &[95.0],
        &[Some(90.0)],
        &[Some(90.0)],
    )
    .await;
    let token = CancellationToken::new();
    let sink = Arc::new(CancellingSink {
        events: RecordingSink::new(),
        token: token.clone(),
        trigger: "answer_generation_iter_1".into(),
    });
    let pipeline = h.builder.build().unwrap();
    let run = pipeline
        .answer_with_progress(QUESTION, sink.clone(), token)
        .await;

    assert_eq!(run.status, RunStatus::Failed);
    let failure = run.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert_eq!(failure.stage, "claims_extraction_iter_1");
    assert_eq!(run.answer.as_deref(), Some(ANSWER));

    let events = sink.events.events();
    let last = events.last().unwrap();
    assert_eq!(last.stage, "answer_generation_iter_1");
    assert_eq!(last.status, ProgressStatus::Completed);
    assert!(events.iter().all(|e| e.status != ProgressStatus::Finished));
}

#[tokio::test]
async fn test_concurrent_runs_are_independent() {
    let h = harness(
        config(1),
        ScriptedGenerator::new(&[ANSWER]),
        &[95.0],
        &[Some(90.0)],
        &[Some(90.0)],
    )
    .await;
    let pipeline = Arc::new(h.builder.build().unwrap());

    let (a, b) = tokio::join!(
        pipeline.answer(QUESTION),
        pipeline.answer("What plans does Key Value offer?")
    );
    assert_ne!(a.id, b.id);
    assert_eq!(a.status, RunStatus::Accepted);
    assert_eq!(b.status, RunStatus::Accepted);
    assert_eq!(a.stages.len(), b.stages.len());
    assert_eq!(b.sources[0].document.id, "kv-plans");
}

#[test]
fn test_config_layers_workspace_then_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = dir.path().join(".docqa");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("config.toml"),
        "[gate]\nmax_iterations = 3\nquality_threshold = 80.0\n\n[retrieval]\ntop_k = 7\n",
    )
    .unwrap();

    let loaded = load_config(Some(dir.path()), None).unwrap();
    assert_eq!(loaded.gate.max_iterations, 3);
    assert_eq!(loaded.retrieval.top_k, 7);
    assert_eq!(loaded.gate.quality_threshold, 80.0);
    assert_eq!(loaded.verification.threshold, QaConfig::default().verification.threshold);

    let mut overrides = loaded.clone();
    overrides.gate.max_iterations = 2;
    let layered = load_config(Some(dir.path()), Some(&overrides)).unwrap();
    assert_eq!(layered.gate.max_iterations, 2);
    assert_eq!(layered.retrieval.top_k, 7);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_at_build() {
    let mut cfg = config(1);
    cfg.retrieval.lexical_weight = 1.5;
    let h = harness(cfg, ScriptedGenerator::new(&[ANSWER]), &[95.0], &[Some(90.0)], &[Some(90.0)]).await;
    let err = h.builder.build().unwrap_err();
    assert!(err.to_string().contains("lexical_weight"));
}
