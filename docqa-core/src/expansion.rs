//! Query expansion for broad questions.
//!
//! A broad question ("what database plans are there?") is rephrased into a
//! couple of alternative queries so retrieval covers more of the corpus.
//! Retrieval runs once per phrasing and the fused lists are merged by
//! document id.

use crate::brain::Brain;
use crate::embeddings::cosine_similarity;
use crate::error::LlmError;
use crate::types::{FusedResult, TokenUsage};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Terms that mark a question as covering a whole category.
const BROAD_TERMS: &[&str] = &[
    "database",
    "plan",
    "tier",
    "option",
    "service",
    "storage",
    "backup",
    "monitoring",
    "scaling",
    "pricing",
    "cost",
    "feature",
    "capability",
];

/// Phrases that mark a question as already targeted.
const SPECIFIC_INDICATORS: &[&str] = &[
    "how do i",
    "how to",
    "error",
    "troubleshoot",
    "specific",
    "exactly",
    "step by step",
];

/// Questions longer than this many words are treated as detailed.
const DETAILED_WORD_COUNT: usize = 15;

/// Alternative phrasings kept from the expander, besides the original.
pub const MAX_VARIATIONS: usize = 2;

/// Whether a question is broad enough to benefit from expansion.
pub fn should_expand_query(question: &str) -> bool {
    let lowered = question.to_lowercase();
    let broad = BROAD_TERMS.iter().any(|t| lowered.contains(t));
    let specific = SPECIFIC_INDICATORS.iter().any(|t| lowered.contains(t));
    let detailed = question.split_whitespace().count() > DETAILED_WORD_COUNT;

    let expand = broad && !(specific || detailed);
    debug!(broad, specific, detailed, expand, "Query expansion decision");
    expand
}

/// Queries to retrieve with; the original question is always first.
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    pub queries: Vec<String>,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

impl Expansion {
    /// No expansion: just the question, free.
    pub fn original(question: &str) -> Self {
        Self {
            queries: vec![question.to_string()],
            usage: TokenUsage::default(),
            cost_usd: 0.0,
        }
    }
}

#[async_trait]
pub trait QueryExpander: Send + Sync {
    async fn expand(&self, question: &str) -> Result<Expansion, LlmError>;
}

const EXPANSION_PROMPT: &str = r#"You are a search query expert for a technical documentation corpus.

Given a user's question, write alternative phrasings that would retrieve relevant documentation from different angles.

Original question: {question}

Guidelines:
1. If the question names a general category, mention the specific products in that category.
2. Use synonyms: database/datastore, plan/tier/instance type, pricing/cost/billing, backup/recovery/restore.
3. Approach different aspects: features, configuration, pricing, limitations.
4. Mix one broad phrasing with one or two product-specific phrasings.

Return ONLY a JSON array of 2-3 questions.

Format: ["rephrased question", "variation 1", "variation 2"]"#;

/// Expander backed by a small, cheap completion model.
#[derive(Debug, Clone)]
pub struct LlmQueryExpander {
    brain: Brain,
}

impl LlmQueryExpander {
    pub fn new(brain: Brain) -> Self {
        Self { brain }
    }
}

#[async_trait]
impl QueryExpander for LlmQueryExpander {
    async fn expand(&self, question: &str) -> Result<Expansion, LlmError> {
        let prompt = EXPANSION_PROMPT.replace("{question}", question);
        let reply = self.brain.ask(&prompt).await?;

        let queries = match parse_variations(&reply.text) {
            Some(variations) => with_original(question, variations),
            None => {
                warn!("Query expansion reply was not a JSON array, using the original question");
                vec![question.to_string()]
            }
        };

        debug!(variations = queries.len(), cost_usd = reply.cost_usd, "Query expanded");
        Ok(Expansion {
            queries,
            usage: reply.usage,
            cost_usd: reply.cost_usd,
        })
    }
}

/// Parse a JSON array of strings, tolerating a surrounding code fence.
pub fn parse_variations(text: &str) -> Option<Vec<String>> {
    let body = strip_code_fence(text);
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let items = value.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

/// Strip a leading and trailing markdown fence line, if present.
pub(crate) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let body = match trimmed.find('\n') {
        Some(newline) => &trimmed[newline + 1..],
        None => return "",
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

fn with_original(question: &str, variations: Vec<String>) -> Vec<String> {
    let mut queries = vec![question.to_string()];
    for variation in variations.into_iter().take(MAX_VARIATIONS) {
        if !queries.iter().any(|q| q.eq_ignore_ascii_case(&variation)) {
            queries.push(variation);
        }
    }
    queries
}

/// Merge per-query result lists: one entry per document id keeping its
/// highest combined score, ordered by score then id, cut to `top_k`.
pub fn merge_results(lists: Vec<Vec<FusedResult>>, top_k: usize) -> Vec<FusedResult> {
    let mut best: HashMap<String, FusedResult> = HashMap::new();
    for result in lists.into_iter().flatten() {
        match best.get(&result.document.id) {
            Some(existing) if existing.combined_score >= result.combined_score => {}
            _ => {
                best.insert(result.document.id.clone(), result);
            }
        }
    }

    let mut merged: Vec<FusedResult> = best.into_values().collect();
    merged.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.document.id.cmp(&b.document.id))
    });
    merged.truncate(top_k);
    merged
}

/// Recompute each result's similarity against the original question, so
/// results found through a variation report a comparable score.
pub fn anchor_similarity(results: &mut [FusedResult], question_embedding: &[f32]) {
    for result in results {
        result.similarity = cosine_similarity(question_embedding, &result.document.embedding);
    }
}
