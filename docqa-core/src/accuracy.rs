//! Technical accuracy check.

use crate::brain::Brain;
use crate::error::LlmError;
use crate::evaluation::extract_score;
use crate::run::AccuracyReport;
use crate::types::{Claim, TokenUsage};
use async_trait::async_trait;
use tracing::{debug, info};

/// Verification rate at or above which an error-free answer is trusted.
const TRUSTED_VERIFICATION_RATE: f64 = 0.7;
/// Scores below this are lifted for trusted answers...
const BOOST_BELOW: f64 = 85.0;
/// ...to this.
const BOOSTED_SCORE: f64 = 90.0;

#[derive(Debug, Clone, Copy)]
pub struct AccuracyRequest<'a> {
    pub question: &'a str,
    pub answer: &'a str,
    pub claims: &'a [Claim],
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccuracyVerdict {
    pub report: AccuracyReport,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

#[async_trait]
pub trait AccuracyJudge: Send + Sync {
    async fn check(&self, request: AccuracyRequest<'_>) -> Result<AccuracyVerdict, LlmError>;
}

const ACCURACY_PROMPT: &str = "You are a technical accuracy reviewer for product documentation answers. Evaluate the technical accuracy of the answer below.

Question: {question}

Original Answer:
{answer}

Extracted Claims:
{claims}

Verification Results:
{verification}

Evaluation Criteria:
- If most claims are verified (70%+), the answer is likely accurate (score 90-100)
- If the answer contains invented information (plan names, features, prices not in the documentation), score 0-30
- If the answer conflates different products or plan types, score 20-40
- Only penalize actual technical errors or misleading information; minor omissions should not weigh heavily

Format your response as:
ACCURACY_SCORE: [0-100]
ERRORS:
- [error, stating whether it is a hallucination or a misinterpretation]
CORRECTIONS:
- [correction]

If there are no errors, omit the ERRORS and CORRECTIONS sections.";

/// Render claims with their verification status for the prompt.
fn format_claims(claims: &[Claim]) -> String {
    if claims.is_empty() {
        return "(no claims extracted)".to_string();
    }
    claims
        .iter()
        .map(|c| format!("- {} (verified: {}, score: {:.2})", c.text, c.verified, c.confidence))
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn verification_rate(claims: &[Claim]) -> f64 {
    if claims.is_empty() {
        return 0.0;
    }
    claims.iter().filter(|c| c.verified).count() as f64 / claims.len() as f64
}

/// Accuracy judge backed by a completion model.
#[derive(Debug, Clone)]
pub struct LlmAccuracyJudge {
    brain: Brain,
}

impl LlmAccuracyJudge {
    pub fn new(brain: Brain) -> Self {
        Self { brain }
    }
}

#[async_trait]
impl AccuracyJudge for LlmAccuracyJudge {
    async fn check(&self, request: AccuracyRequest<'_>) -> Result<AccuracyVerdict, LlmError> {
        let verified = request.claims.iter().filter(|c| c.verified).count();
        let prompt = ACCURACY_PROMPT
            .replace("{question}", request.question)
            .replace("{answer}", request.answer)
            .replace("{claims}", &format_claims(request.claims))
            .replace(
                "{verification}",
                &format!("{verified}/{} claims verified", request.claims.len()),
            );

        let reply = self.brain.ask(&prompt).await?;
        let mut report = parse_accuracy(&reply.text)?;
        apply_verification_boost(&mut report, verification_rate(request.claims));

        info!(
            accuracy_score = report.score,
            errors = report.errors.len(),
            corrections = report.corrections.len(),
            cost_usd = reply.cost_usd,
            "Accuracy checked"
        );

        Ok(AccuracyVerdict {
            report,
            usage: reply.usage,
            cost_usd: reply.cost_usd,
        })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    None,
    Errors,
    Corrections,
}

/// Parse an `ACCURACY_SCORE` / `ERRORS:` / `CORRECTIONS:` reply.
///
/// A reply without a score is an error rather than a silent default.
pub fn parse_accuracy(text: &str) -> Result<AccuracyReport, LlmError> {
    let mut score = None;
    let mut errors = Vec::new();
    let mut corrections = Vec::new();
    let mut section = Section::None;

    for line in text.lines().map(str::trim) {
        let line = line.trim_start_matches("**").trim_start();
        if let Some(value) = line.strip_prefix("ACCURACY_SCORE:") {
            score = extract_score(value);
        } else if line.starts_with("ERRORS:") {
            section = Section::Errors;
        } else if line.starts_with("CORRECTIONS:") {
            section = Section::Corrections;
        } else if let Some(item) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
            let item = item.trim();
            if item.is_empty() || is_placeholder(item) {
                continue;
            }
            match section {
                Section::Errors => errors.push(item.to_string()),
                Section::Corrections => corrections.push(item.to_string()),
                Section::None => {}
            }
        }
    }

    let score = score.ok_or_else(|| LlmError::ResponseParse {
        message: "accuracy reply has no ACCURACY_SCORE".to_string(),
    })?;
    debug!(score, errors = errors.len(), "Accuracy reply parsed");
    Ok(AccuracyReport {
        score,
        errors,
        corrections,
    })
}

fn is_placeholder(item: &str) -> bool {
    matches!(item.to_lowercase().trim_end_matches('.'), "none" | "n/a" | "no errors")
}

/// Lift an error-free, well-verified answer's score. Returns whether it did.
pub fn apply_verification_boost(report: &mut AccuracyReport, verification_rate: f64) -> bool {
    if verification_rate >= TRUSTED_VERIFICATION_RATE
        && report.score < BOOST_BELOW
        && report.errors.is_empty()
    {
        info!(
            from = report.score,
            to = BOOSTED_SCORE,
            verification_rate,
            "Boosting accuracy score for well-verified answer"
        );
        report.score = BOOSTED_SCORE;
        return true;
    }
    false
}
