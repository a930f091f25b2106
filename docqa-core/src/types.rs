//! Core data types shared by the retrieval engine and the pipeline stages.

use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;

/// Token usage statistics from an LLM or embedding call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn new(input_tokens: usize, output_tokens: usize) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// An immutable corpus entry.
///
/// Documents are produced by ingestion outside this crate and shared
/// read-only between the indexes and the pipeline as `Arc<Document>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub source: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        source: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            source: source.into(),
            title: title.into(),
            section: None,
            metadata: HashMap::new(),
            embedding: Vec::new(),
        }
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    /// The text the lexical index stores for this document.
    pub fn lexical_text(&self) -> String {
        match &self.section {
            Some(section) if section != &self.title => {
                format!("{}\n{}\n{}", self.title, section, self.content)
            }
            _ => format!("{}\n{}", self.title, self.content),
        }
    }

    /// First `max_chars` characters of the content, cut on a char boundary.
    pub fn excerpt(&self, max_chars: usize) -> String {
        if self.content.chars().count() <= max_chars {
            return self.content.clone();
        }
        let cut: String = self.content.chars().take(max_chars).collect();
        format!("{}...", cut.trim_end())
    }
}

/// Which index produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalSource {
    Semantic,
    Lexical,
}

impl std::fmt::Display for RetrievalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetrievalSource::Semantic => write!(f, "semantic"),
            RetrievalSource::Lexical => write!(f, "lexical"),
        }
    }
}

/// A ranked hit from exactly one index.
///
/// `score` is on the producing index's own scale (cosine similarity for the
/// vector index, BM25 for the lexical index) and is never compared across
/// sources.
#[derive(Debug, Clone)]
pub struct RetrievalCandidate {
    pub document: Arc<Document>,
    pub score: f32,
    /// 1-based position in the producing index's result list.
    pub rank: usize,
    pub source: RetrievalSource,
}

impl RetrievalCandidate {
    /// Assign 1-based ranks to an already ordered list of scored documents.
    pub fn ranked(hits: Vec<(Arc<Document>, f32)>, source: RetrievalSource) -> Vec<Self> {
        hits.into_iter()
            .enumerate()
            .map(|(i, (document, score))| Self {
                document,
                score,
                rank: i + 1,
                source,
            })
            .collect()
    }
}

/// A document after rank fusion, with the ranks that produced its score.
#[derive(Debug, Clone, Serialize)]
pub struct FusedResult {
    #[serde(serialize_with = "serialize_document_ref")]
    pub document: Arc<Document>,
    pub combined_score: f64,
    pub semantic_rank: Option<usize>,
    pub lexical_rank: Option<usize>,
    /// Cosine similarity between the query embedding and the document
    /// embedding. Annotated after fusion; not an input to it.
    pub similarity: f32,
}

impl FusedResult {
    pub fn min_rank(&self) -> usize {
        match (self.semantic_rank, self.lexical_rank) {
            (Some(s), Some(l)) => s.min(l),
            (Some(s), None) => s,
            (None, Some(l)) => l,
            (None, None) => usize::MAX,
        }
    }
}

/// Compact view of a document used when serializing run snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRef<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub source: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<&'a str>,
    pub excerpt: String,
}

fn serialize_document_ref<S: Serializer>(
    document: &Arc<Document>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    DocumentRef {
        id: &document.id,
        title: &document.title,
        source: &document.source,
        section: document.section.as_deref(),
        excerpt: document.excerpt(240),
    }
    .serialize(serializer)
}

/// An atomic assertion extracted from a generated answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    pub verified: bool,
    /// Best similarity between the claim and any retrieved document.
    pub confidence: f32,
    /// Ids of the top supporting documents, recorded even for near-misses.
    pub supporting_documents: Vec<String>,
    /// Set when verification itself failed (retrieval error or timeout).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_error: Option<String>,
}

impl Claim {
    pub fn unverified_with_error(text: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            verified: false,
            confidence: 0.0,
            supporting_documents: Vec::new(),
            verification_error: Some(error.into()),
        }
    }
}

/// Sub-scores every judge reports, each 0-100.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CriteriaScores {
    pub technical_accuracy: f64,
    pub clarity: f64,
    pub completeness: f64,
    pub practical_value: f64,
}

impl CriteriaScores {
    /// Named criteria, in report order.
    pub fn named(&self) -> [(&'static str, f64); 4] {
        [
            ("technical accuracy", self.technical_accuracy),
            ("clarity", self.clarity),
            ("completeness", self.completeness),
            ("practical value", self.practical_value),
        ]
    }

    /// Weighted overall score (30/25/25/20).
    pub fn weighted(&self) -> f64 {
        self.technical_accuracy * 0.30
            + self.clarity * 0.25
            + self.completeness * 0.25
            + self.practical_value * 0.20
    }
}

/// One judge's assessment of one answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub judge: String,
    pub score: f64,
    pub criteria: CriteriaScores,
    pub feedback: String,
}

/// Categorical closeness of the two judges' overall scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementLevel {
    High,
    Low,
    /// Only one judge produced a result.
    SingleRater,
}

impl std::fmt::Display for AgreementLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgreementLevel::High => write!(f, "high"),
            AgreementLevel::Low => write!(f, "low"),
            AgreementLevel::SingleRater => write!(f, "single_rater"),
        }
    }
}
