//! Claim extraction and verification.
//!
//! An answer is broken into atomic assertions, and each assertion is checked
//! by running it back through hybrid retrieval: a claim counts as verified
//! when some retrieved document is similar enough to it. Claims verify
//! concurrently under a semaphore, and one claim failing to verify never
//! affects the others.

use crate::brain::Brain;
use crate::config::VerificationConfig;
use crate::embeddings::Embedder;
use crate::error::LlmError;
use crate::expansion::strip_code_fence;
use crate::retrieval::{RetrievalRequest, RetrievalStage};
use crate::types::{Claim, TokenUsage};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Raw extractor output plus accounting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedClaims {
    pub claims: Vec<String>,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

#[async_trait]
pub trait ClaimExtractor: Send + Sync {
    async fn extract(&self, answer: &str) -> Result<ExtractedClaims, LlmError>;
}

const CLAIMS_PROMPT: &str = r#"Extract all factual claims from the following answer. A factual claim is a specific, verifiable statement about the product, its features, pricing or capabilities.

Answer:
{answer}

Each claim must be:
- A single, specific fact (one sentence)
- Kept on a single line
- Independently verifiable
- Technical or product-related

Return a JSON object with a "claims" array:
{
  "claims": [
    "The service supports Node.js versions 18 and 20",
    "Postgres databases include automated daily backups"
  ]
}"#;

/// Extractor backed by a JSON-speaking completion model.
#[derive(Debug, Clone)]
pub struct LlmClaimExtractor {
    brain: Brain,
}

impl LlmClaimExtractor {
    pub fn new(brain: Brain) -> Self {
        Self { brain }
    }
}

#[async_trait]
impl ClaimExtractor for LlmClaimExtractor {
    async fn extract(&self, answer: &str) -> Result<ExtractedClaims, LlmError> {
        let prompt = CLAIMS_PROMPT.replace("{answer}", answer);
        let reply = self.brain.ask(&prompt).await?;

        if reply.finish_reason.as_deref() == Some("length") {
            warn!(
                output_tokens = reply.usage.output_tokens,
                answer_len = answer.len(),
                "Claims extraction hit max_tokens; reply is truncated"
            );
        }

        let claims = parse_claims(&reply.text);
        debug!(claims = claims.len(), cost_usd = reply.cost_usd, "Claims parsed");
        Ok(ExtractedClaims {
            claims,
            usage: reply.usage,
            cost_usd: reply.cost_usd,
        })
    }
}

/// Pull claim strings out of an extractor reply.
///
/// Accepts `{"claims": [...]}` (keys may carry stray whitespace), a bare
/// array, or an object whose first array value holds the claims. Anything
/// unparsable yields an empty list.
pub fn parse_claims(text: &str) -> Vec<String> {
    let body = strip_code_fence(text);
    let parsed: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Claims reply is not valid JSON");
            return Vec::new();
        }
    };

    let items = match &parsed {
        Value::Array(items) => Some(items),
        Value::Object(map) => map
            .iter()
            .find(|(key, _)| key.trim() == "claims")
            .and_then(|(_, value)| value.as_array())
            .or_else(|| map.values().find_map(Value::as_array)),
        _ => None,
    };

    match items {
        Some(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(obj) => obj
                    .get("claim")
                    .or_else(|| obj.get("text"))
                    .and_then(Value::as_str)
                    .map(String::from),
                _ => None,
            })
            .collect(),
        None => {
            warn!("Claims reply has no claims array");
            Vec::new()
        }
    }
}

/// Trim, collapse line breaks, drop empties and case-insensitive duplicates.
pub fn normalize_claims<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut claims = Vec::new();
    for claim in raw {
        let collapsed = claim.as_ref().split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            continue;
        }
        if seen.insert(collapsed.to_lowercase()) {
            claims.push(collapsed);
        }
    }
    claims
}

/// Split an answer into sentences, dropping list markers and headings.
pub fn split_sentences(answer: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    for line in answer.lines() {
        let line = line
            .trim()
            .trim_start_matches(['#', '-', '*', '>'])
            .trim();
        let mut current = String::new();
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            current.push(c);
            let at_boundary = matches!(c, '.' | '!' | '?')
                && chars.peek().is_none_or(|next| next.is_whitespace());
            if at_boundary {
                sentences.push(std::mem::take(&mut current));
            }
        }
        sentences.push(current);
    }

    let sentences = normalize_claims(sentences);
    if sentences.is_empty() && !answer.trim().is_empty() {
        return normalize_claims([answer]);
    }
    sentences
}

/// Per-claim verification outcome for a whole answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerificationReport {
    pub claims: Vec<Claim>,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

impl VerificationReport {
    pub fn verified_count(&self) -> usize {
        self.claims.iter().filter(|c| c.verified).count()
    }

    /// Claims whose verification itself failed.
    pub fn errored_count(&self) -> usize {
        self.claims
            .iter()
            .filter(|c| c.verification_error.is_some())
            .count()
    }

    /// Fraction verified; 0.0 when there are no claims.
    pub fn verification_rate(&self) -> f64 {
        if self.claims.is_empty() {
            0.0
        } else {
            self.verified_count() as f64 / self.claims.len() as f64
        }
    }

    pub fn degraded(&self) -> bool {
        self.errored_count() > 0
    }

    pub fn unverified(&self) -> impl Iterator<Item = &Claim> {
        self.claims.iter().filter(|c| !c.verified)
    }
}

struct ClaimCheck {
    claim: Claim,
    usage: TokenUsage,
    cost_usd: f64,
}

/// Extraction plus retrieval-backed verification.
#[derive(Clone)]
pub struct ClaimsPipeline {
    extractor: Arc<dyn ClaimExtractor>,
    embedder: Arc<dyn Embedder>,
    retrieval: RetrievalStage,
    config: VerificationConfig,
    similarity_floor: f32,
}

impl ClaimsPipeline {
    pub fn new(
        extractor: Arc<dyn ClaimExtractor>,
        embedder: Arc<dyn Embedder>,
        retrieval: RetrievalStage,
        config: VerificationConfig,
        similarity_floor: f32,
    ) -> Self {
        Self {
            extractor,
            embedder,
            retrieval,
            config,
            similarity_floor,
        }
    }

    /// Extract and normalize claims. A non-empty answer always yields at
    /// least one claim; when the extractor finds none, sentences are used.
    pub async fn extract(&self, answer: &str) -> Result<ExtractedClaims, LlmError> {
        if answer.trim().is_empty() {
            return Ok(ExtractedClaims::default());
        }
        let mut extracted = self.extractor.extract(answer).await?;
        extracted.claims = normalize_claims(&extracted.claims);
        if extracted.claims.is_empty() {
            warn!(answer_len = answer.len(), "Extractor found no claims, splitting sentences");
            extracted.claims = split_sentences(answer);
        }
        Ok(extracted)
    }

    /// Verify every claim, preserving input order.
    pub async fn verify(&self, claims: &[String]) -> VerificationReport {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let budget = Duration::from_secs(self.config.claim_timeout_secs);

        let checks = claims.iter().map(|text| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(e) => return errored(text, e.to_string()),
                };
                match tokio::time::timeout(budget, self.verify_one(text)).await {
                    Ok(check) => check,
                    Err(_) => errored(
                        text,
                        format!("verification timed out after {}s", budget.as_secs()),
                    ),
                }
            }
        });

        let mut report = VerificationReport::default();
        for check in join_all(checks).await {
            report.usage.accumulate(&check.usage);
            report.cost_usd += check.cost_usd;
            report.claims.push(check.claim);
        }

        info!(
            claims = report.claims.len(),
            verified = report.verified_count(),
            errored = report.errored_count(),
            verification_rate = report.verification_rate(),
            "Claims verified"
        );
        report
    }

    async fn verify_one(&self, text: &str) -> ClaimCheck {
        let embedding = match self.embedder.embed(text).await {
            Ok(embedding) => embedding,
            Err(e) => return errored(text, format!("embedding failed: {e}")),
        };

        let request = RetrievalRequest {
            query: text,
            embedding: &embedding.vector,
            top_k: self.config.top_k,
            similarity_floor: self.similarity_floor,
        };
        let outcome = match self.retrieval.retrieve(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return ClaimCheck {
                    claim: Claim::unverified_with_error(text, format!("retrieval failed: {e}")),
                    usage: embedding.usage,
                    cost_usd: embedding.cost_usd,
                };
            }
        };

        let mut by_similarity: Vec<_> = outcome.results.iter().collect();
        by_similarity.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let confidence = outcome.best_similarity();
        let verified = !by_similarity.is_empty() && confidence >= self.config.threshold;
        let supporting_documents = by_similarity
            .iter()
            .take(self.config.supporting_docs)
            .map(|r| r.document.id.clone())
            .collect();

        debug!(
            verified,
            confidence,
            documents = outcome.results.len(),
            threshold = self.config.threshold,
            "Claim checked"
        );

        ClaimCheck {
            claim: Claim {
                text: text.to_string(),
                verified,
                confidence,
                supporting_documents,
                verification_error: None,
            },
            usage: embedding.usage,
            cost_usd: embedding.cost_usd,
        }
    }
}

fn errored(text: &str, error: String) -> ClaimCheck {
    warn!(error = %error, "Claim verification failed");
    ClaimCheck {
        claim: Claim::unverified_with_error(text, error),
        usage: TokenUsage::default(),
        cost_usd: 0.0,
    }
}

impl std::fmt::Debug for ClaimsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimsPipeline")
            .field("retrieval", &self.retrieval)
            .field("config", &self.config)
            .field("similarity_floor", &self.similarity_floor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::config::RetrievalConfig;
    use crate::embeddings::{Embedding, LocalEmbedder};
    use crate::search::{InMemoryVectorIndex, TantivyLexicalIndex};
    use crate::types::Document;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[test]
    fn test_parse_claims_object_and_array() {
        assert_eq!(
            parse_claims(r#"{"claims": ["a", "b"]}"#),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(parse_claims(r#"["x"]"#), vec!["x".to_string()]);
        assert_eq!(parse_claims("{\"\\n  claims \": [\"k\"]}"), vec!["k".to_string()]);
        assert_eq!(
            parse_claims(r#"{"facts": ["first list"], "other": 1}"#),
            vec!["first list".to_string()]
        );
        assert_eq!(
            parse_claims("```json\n{\"claims\": [\"fenced\"]}\n```"),
            vec!["fenced".to_string()]
        );
    }

    #[test]
    fn test_parse_claims_garbage() {
        assert!(parse_claims("no json here").is_empty());
        assert!(parse_claims(r#"{"claims": "not a list"}"#).is_empty());
        assert!(parse_claims("42").is_empty());
    }

    #[test]
    fn test_normalize_claims() {
        let claims = normalize_claims([
            "  Backups run daily.  ",
            "",
            "Backups\nrun   daily.",
            "BACKUPS RUN DAILY.",
            "Free databases expire.",
        ]);
        assert_eq!(claims, vec!["Backups run daily.", "Free databases expire."]);
    }

    #[test]
    fn test_split_sentences() {
        let sentences = split_sentences(
            "## Backups\n- Paid plans get daily backups. Free plans do not!\nVersion 1.5 is current.",
        );
        assert_eq!(
            sentences,
            vec![
                "Backups",
                "Paid plans get daily backups.",
                "Free plans do not!",
                "Version 1.5 is current."
            ]
        );
        assert!(split_sentences("   ").is_empty());
        assert_eq!(split_sentences("---"), vec!["---"]);
    }

    #[tokio::test]
    async fn test_llm_extractor_parses_reply() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_text(r#"{"claims": ["Postgres has backups", "Key Value has plans"]}"#);
        let extractor = LlmClaimExtractor::new(Brain::new(provider));
        let extracted = extractor.extract("answer").await.unwrap();
        assert_eq!(extracted.claims.len(), 2);
        assert_eq!(extracted.usage, TokenUsage::new(100, 50));
    }

    fn corpus() -> Vec<Arc<Document>> {
        let embedder = LocalEmbedder::new(256);
        [
            ("pg-backups", "Postgres", "Postgres backups run daily at midnight."),
            ("kv-plans", "Key Value", "Key Value offers free starter and pro instance types."),
            ("cron", "Cron Jobs", "Cron jobs run on a schedule you define."),
        ]
        .into_iter()
        .map(|(id, title, content)| {
            Arc::new(Document::new(id, title, "https://docs.example.com", content)
                .with_embedding(embedder.embed_text(content)))
        })
        .collect()
    }

    /// Local embedder that fails for claims containing a marker word.
    struct FlakyEmbedder {
        inner: LocalEmbedder,
        marker: &'static str,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, text: &str) -> Result<Embedding, LlmError> {
            if text.contains(self.marker) {
                return Err(LlmError::Connection {
                    message: "embedding endpoint unreachable".into(),
                });
            }
            self.inner.embed(text).await
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn provider_name(&self) -> &str {
            "flaky"
        }
    }

    struct NoClaims;

    #[async_trait]
    impl ClaimExtractor for NoClaims {
        async fn extract(&self, _answer: &str) -> Result<ExtractedClaims, LlmError> {
            Ok(ExtractedClaims::default())
        }
    }

    fn pipeline(extractor: Arc<dyn ClaimExtractor>, marker: &'static str) -> ClaimsPipeline {
        let docs = corpus();
        let retrieval = RetrievalStage::new(
            Arc::new(InMemoryVectorIndex::build(&docs).unwrap()),
            Arc::new(TantivyLexicalIndex::build(&docs).unwrap()),
            &RetrievalConfig::default(),
        );
        ClaimsPipeline::new(
            extractor,
            Arc::new(FlakyEmbedder {
                inner: LocalEmbedder::new(256),
                marker,
            }),
            retrieval,
            VerificationConfig::default(),
            0.3,
        )
    }

    #[tokio::test]
    async fn test_extract_falls_back_to_sentences() {
        let claims = pipeline(Arc::new(NoClaims), "FAIL");
        let extracted = claims.extract("Backups run daily. Plans vary.").await.unwrap();
        assert_eq!(extracted.claims, vec!["Backups run daily.", "Plans vary."]);

        let empty = claims.extract("   ").await.unwrap();
        assert!(empty.claims.is_empty());
    }

    #[tokio::test]
    async fn test_verify_marks_supported_and_unsupported() {
        let claims = pipeline(Arc::new(NoClaims), "FAIL");
        let report = claims
            .verify(&[
                "Postgres backups run daily".to_string(),
                "Static sites deploy from git".to_string(),
            ])
            .await;

        assert_eq!(report.claims.len(), 2);
        let supported = &report.claims[0];
        assert!(supported.verified);
        assert!(supported.confidence >= 0.3);
        assert_eq!(supported.supporting_documents[0], "pg-backups");
        assert!(supported.supporting_documents.len() <= 2);

        let unsupported = &report.claims[1];
        assert!(!unsupported.verified);
        assert!(unsupported.verification_error.is_none());
        assert!((report.verification_rate() - 0.5).abs() < 1e-9);
        assert!(!report.degraded());
    }

    #[tokio::test]
    async fn test_one_failing_claim_does_not_affect_others() {
        let claims = pipeline(Arc::new(NoClaims), "FAIL");
        let texts: Vec<String> = vec![
            "Postgres backups run daily".into(),
            "Key Value offers pro instance types".into(),
            "FAIL this claim".into(),
            "Cron jobs run on a schedule".into(),
            "Static sites deploy from git".into(),
        ];
        let report = claims.verify(&texts).await;

        assert_eq!(report.claims.len(), 5);
        assert_eq!(report.errored_count(), 1);
        assert!(report.degraded());

        let failed = &report.claims[2];
        assert!(!failed.verified);
        assert!(failed.verification_error.as_deref().unwrap().contains("unreachable"));

        for (i, claim) in report.claims.iter().enumerate() {
            assert_eq!(claim.text, texts[i]);
            if i != 2 {
                assert!(claim.verification_error.is_none());
            }
        }
        assert!(report.claims[0].verified);
        assert!(report.claims[1].verified);
        assert!(report.claims[3].verified);
    }

    /// Local embedder that records how many claims are embedded at once.
    struct InFlightEmbedder {
        inner: LocalEmbedder,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl InFlightEmbedder {
        fn new() -> Self {
            Self {
                inner: LocalEmbedder::new(256),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Embedder for InFlightEmbedder {
        async fn embed(&self, text: &str) -> Result<Embedding, LlmError> {
            let now = self.current.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            self.peak.fetch_max(now, AtomicOrdering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, AtomicOrdering::SeqCst);
            self.inner.embed(text).await
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn provider_name(&self) -> &str {
            "in-flight"
        }
    }

    fn bounded_pipeline(embedder: Arc<InFlightEmbedder>, concurrency: usize) -> ClaimsPipeline {
        let docs = corpus();
        let retrieval = RetrievalStage::new(
            Arc::new(InMemoryVectorIndex::build(&docs).unwrap()),
            Arc::new(TantivyLexicalIndex::build(&docs).unwrap()),
            &RetrievalConfig::default(),
        );
        ClaimsPipeline::new(
            Arc::new(NoClaims),
            embedder,
            retrieval,
            VerificationConfig {
                concurrency,
                ..VerificationConfig::default()
            },
            0.3,
        )
    }

    fn many_claims(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("Postgres backups run daily {i}")).collect()
    }

    #[tokio::test]
    async fn test_verification_respects_concurrency_cap() {
        let embedder = Arc::new(InFlightEmbedder::new());
        let claims = bounded_pipeline(Arc::clone(&embedder), 3);
        let report = claims.verify(&many_claims(10)).await;

        assert_eq!(report.claims.len(), 10);
        assert_eq!(report.errored_count(), 0);
        let peak = embedder.peak.load(AtomicOrdering::SeqCst);
        assert!(peak <= 3, "peak in-flight {peak} exceeded cap 3");
        assert!(peak >= 2, "claims were not verified concurrently");
    }

    #[tokio::test]
    async fn test_zero_concurrency_verifies_one_at_a_time() {
        let embedder = Arc::new(InFlightEmbedder::new());
        let claims = bounded_pipeline(Arc::clone(&embedder), 0);
        let report = claims.verify(&many_claims(4)).await;

        assert_eq!(report.claims.len(), 4);
        assert_eq!(embedder.peak.load(AtomicOrdering::SeqCst), 1);
    }
}
