//! Dual-judge quality evaluation.
//!
//! Two independently configured judges score the same answer concurrently.
//! Their overall scores are averaged and compared: close scores mean high
//! agreement. One judge failing leaves a single-rater result; both failing
//! fails the evaluation.

use crate::brain::Brain;
use crate::error::LlmError;
use crate::types::{AgreementLevel, Claim, CriteriaScores, EvaluationResult, TokenUsage};
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info, warn};

static NUMBER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").ok());

/// First number in `text`, rounded and clamped to [0, 100].
///
/// `85/100` reads as 85 and `87.6` as 88.
pub fn extract_score(text: &str) -> Option<f64> {
    let found = NUMBER.as_ref()?.find(text)?;
    let value: f64 = found.as_str().parse().ok()?;
    Some(value.round().clamp(0.0, 100.0))
}

#[derive(Debug, Clone, Copy)]
pub struct EvaluationRequest<'a> {
    pub question: &'a str,
    pub answer: &'a str,
    pub document_count: usize,
    /// Claims checked against the corpus earlier in the iteration.
    pub claims: &'a [Claim],
    pub accuracy_score: Option<f64>,
}

/// A judge's result plus the cost of obtaining it.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeVerdict {
    pub result: EvaluationResult,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

#[async_trait]
pub trait QualityJudge: Send + Sync {
    /// Identifier recorded on results, usually the model name.
    fn name(&self) -> &str;

    async fn evaluate(&self, request: EvaluationRequest<'_>) -> Result<JudgeVerdict, LlmError>;
}

const EVALUATION_PROMPT: &str = "You are a quality evaluator for technical documentation answers. Evaluate the following answer on multiple criteria.

Question: {question}

Answer:
{answer}

Source Documents Used: {doc_count}

Verification Results:
{verification}

If the answer essentially says \"I don't know\" or \"information not available\", give it very low scores (0-20) on every criterion, however politely it is written.

Rate the answer on each criterion (0-100):

1. Technical Accuracy (30%): Is the information correct?
2. Clarity & Organization (25%): Is the answer well structured and easy to follow?
3. Completeness (25%): Does it fully address the question with specific details?
4. Practical Value (20%): Is it actionable and useful for developers?

Provide your evaluation in this format:
TECHNICAL_ACCURACY: [0-100]
CLARITY: [0-100]
COMPLETENESS: [0-100]
PRACTICAL_VALUE: [0-100]
OVERALL: [weighted average]
FEEDBACK: [1-2 sentences of constructive feedback]";

/// Quality judge backed by a completion model.
#[derive(Debug, Clone)]
pub struct LlmQualityJudge {
    name: String,
    brain: Brain,
}

impl LlmQualityJudge {
    /// Named after the brain's model.
    pub fn new(brain: Brain) -> Self {
        Self {
            name: brain.model_name().to_string(),
            brain,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl QualityJudge for LlmQualityJudge {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, request: EvaluationRequest<'_>) -> Result<JudgeVerdict, LlmError> {
        let prompt = EVALUATION_PROMPT
            .replace("{question}", request.question)
            .replace("{answer}", request.answer)
            .replace("{doc_count}", &request.document_count.to_string())
            .replace("{verification}", &format_verification(&request));
        let reply = self.brain.ask(&prompt).await?;
        let result = parse_evaluation(&reply.text, &self.name)?;
        Ok(JudgeVerdict {
            result,
            usage: reply.usage,
            cost_usd: reply.cost_usd,
        })
    }
}

/// Claim support and the accuracy check, as shown to the judges.
fn format_verification(request: &EvaluationRequest<'_>) -> String {
    let mut lines = Vec::new();
    if !request.claims.is_empty() {
        let verified = request.claims.iter().filter(|c| c.verified).count();
        lines.push(format!(
            "- {verified}/{} claims supported by the documents",
            request.claims.len()
        ));
        for claim in request.claims.iter().filter(|c| !c.verified) {
            lines.push(format!("- Unsupported: {}", claim.text));
        }
    }
    if let Some(score) = request.accuracy_score {
        lines.push(format!("- Technical accuracy check: {score:.0}/100"));
    }
    if lines.is_empty() {
        return "- None available".to_string();
    }
    lines.join("\n")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    TechnicalAccuracy,
    Clarity,
    Completeness,
    PracticalValue,
    Overall,
    Feedback,
}

const LABELS: &[(&str, Label)] = &[
    ("TECHNICAL_ACCURACY:", Label::TechnicalAccuracy),
    ("CLARITY:", Label::Clarity),
    ("COMPLETENESS:", Label::Completeness),
    ("PRACTICAL_VALUE:", Label::PracticalValue),
    ("DEVELOPER_VALUE:", Label::PracticalValue),
    ("OVERALL:", Label::Overall),
    ("FEEDBACK:", Label::Feedback),
];

/// Criterion weights, in `CriteriaScores` order.
const WEIGHTS: [f64; 4] = [0.30, 0.25, 0.25, 0.20];

fn split_label(line: &str) -> Option<(Label, &str)> {
    let line = line.trim_start_matches("**").trim_start();
    LABELS.iter().find_map(|(prefix, label)| {
        line.strip_prefix(prefix)
            .map(|rest| (*label, rest.trim_start_matches("**").trim()))
    })
}

/// Parse a judge reply into an [`EvaluationResult`].
///
/// A missing `OVERALL` is derived from the criteria present with weights
/// 30/25/25/20. Missing criteria take the overall score. A reply with no
/// score at all is a parse error.
pub fn parse_evaluation(text: &str, judge: &str) -> Result<EvaluationResult, LlmError> {
    let mut criteria: [Option<f64>; 4] = [None; 4];
    let mut overall = None;
    let mut feedback: Vec<String> = Vec::new();
    let mut in_feedback = false;

    for line in text.lines().map(str::trim) {
        match split_label(line) {
            Some((Label::Feedback, rest)) => {
                in_feedback = true;
                if !rest.is_empty() {
                    feedback.push(rest.to_string());
                }
            }
            Some((label, rest)) => {
                in_feedback = false;
                let score = extract_score(rest);
                match label {
                    Label::TechnicalAccuracy => criteria[0] = score.or(criteria[0]),
                    Label::Clarity => criteria[1] = score.or(criteria[1]),
                    Label::Completeness => criteria[2] = score.or(criteria[2]),
                    Label::PracticalValue => criteria[3] = score.or(criteria[3]),
                    Label::Overall => overall = score.or(overall),
                    Label::Feedback => {}
                }
            }
            None if in_feedback && !line.is_empty() => feedback.push(line.to_string()),
            None => {}
        }
    }

    let overall = match overall {
        Some(score) => score,
        None => weighted_present(&criteria).ok_or_else(|| LlmError::ResponseParse {
            message: format!("judge '{judge}' reply contains no scores"),
        })?,
    };
    let fill = |score: Option<f64>| score.unwrap_or(overall);

    debug!(judge, overall, "Evaluation reply parsed");
    Ok(EvaluationResult {
        judge: judge.to_string(),
        score: overall,
        criteria: CriteriaScores {
            technical_accuracy: fill(criteria[0]),
            clarity: fill(criteria[1]),
            completeness: fill(criteria[2]),
            practical_value: fill(criteria[3]),
        },
        feedback: feedback.join(" "),
    })
}

fn weighted_present(criteria: &[Option<f64>; 4]) -> Option<f64> {
    let (sum, weight) = criteria
        .iter()
        .zip(WEIGHTS)
        .filter_map(|(score, w)| score.map(|s| (s * w, w)))
        .fold((0.0, 0.0), |(sum, weight), (s, w)| (sum + s, weight + w));
    (weight > 0.0).then(|| sum / weight)
}

/// Agreement between two overall scores: strictly closer than `delta` is high.
pub fn agreement(a: f64, b: f64, delta: f64) -> AgreementLevel {
    if (a - b).abs() < delta {
        AgreementLevel::High
    } else {
        AgreementLevel::Low
    }
}

/// Combined outcome of both judges.
#[derive(Debug, Clone, PartialEq)]
pub struct DualEvaluation {
    pub results: Vec<EvaluationResult>,
    pub average_score: f64,
    pub agreement: AgreementLevel,
    /// (judge name, error) for each judge that failed.
    pub failed_judges: Vec<(String, String)>,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

impl DualEvaluation {
    pub fn degraded(&self) -> bool {
        !self.failed_judges.is_empty()
    }
}

/// Runs two judges concurrently, each under its own timeout.
#[derive(Clone)]
pub struct DualEvaluator {
    primary: Arc<dyn QualityJudge>,
    secondary: Arc<dyn QualityJudge>,
    judge_timeout: Duration,
    agreement_delta: f64,
}

impl DualEvaluator {
    pub fn new(
        primary: Arc<dyn QualityJudge>,
        secondary: Arc<dyn QualityJudge>,
        judge_timeout: Duration,
        agreement_delta: f64,
    ) -> Self {
        Self {
            primary,
            secondary,
            judge_timeout,
            agreement_delta,
        }
    }

    pub async fn evaluate(&self, request: EvaluationRequest<'_>) -> Result<DualEvaluation, LlmError> {
        let (first, second) = tokio::join!(
            self.bounded(self.primary.as_ref(), request),
            self.bounded(self.secondary.as_ref(), request),
        );

        let mut results = Vec::with_capacity(2);
        let mut failed_judges = Vec::new();
        let mut usage = TokenUsage::default();
        let mut cost_usd = 0.0;

        for (judge, outcome) in [(&self.primary, first), (&self.secondary, second)] {
            match outcome {
                Ok(verdict) => {
                    usage.accumulate(&verdict.usage);
                    cost_usd += verdict.cost_usd;
                    results.push(verdict.result);
                }
                Err(e) => {
                    warn!(judge = judge.name(), error = %e, "Judge failed");
                    failed_judges.push((judge.name().to_string(), e.to_string()));
                }
            }
        }

        let (average_score, agreement) = match results.as_slice() {
            [] => {
                let detail = failed_judges
                    .iter()
                    .map(|(name, e)| format!("{name}: {e}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(LlmError::ApiRequest {
                    message: format!("both judges failed ({detail})"),
                });
            }
            [only] => (only.score, AgreementLevel::SingleRater),
            [a, b, ..] => (
                (a.score + b.score) / 2.0,
                agreement(a.score, b.score, self.agreement_delta),
            ),
        };

        info!(
            average_score,
            agreement = %agreement,
            judges = results.len(),
            cost_usd,
            "Quality evaluated"
        );

        Ok(DualEvaluation {
            results,
            average_score,
            agreement,
            failed_judges,
            usage,
            cost_usd,
        })
    }

    async fn bounded(
        &self,
        judge: &dyn QualityJudge,
        request: EvaluationRequest<'_>,
    ) -> Result<JudgeVerdict, LlmError> {
        tokio::time::timeout(self.judge_timeout, judge.evaluate(request))
            .await
            .unwrap_or(Err(LlmError::Timeout {
                timeout_secs: self.judge_timeout.as_secs(),
            }))
    }
}

impl std::fmt::Debug for DualEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualEvaluator")
            .field("primary", &self.primary.name())
            .field("secondary", &self.secondary.name())
            .field("judge_timeout", &self.judge_timeout)
            .field("agreement_delta", &self.agreement_delta)
            .finish()
    }
}
