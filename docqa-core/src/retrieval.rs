//! Hybrid retrieval stage.
//!
//! Queries the vector and lexical indexes concurrently, each under its own
//! timeout, fuses the two rankings and annotates every fused document with
//! its cosine similarity to the query. Losing one index degrades the stage;
//! losing both fails it.

use crate::config::RetrievalConfig;
use crate::embeddings::cosine_similarity;
use crate::error::SearchError;
use crate::fusion::RankFusion;
use crate::search::{LexicalIndex, VectorIndex};
use crate::types::{FusedResult, RetrievalCandidate, RetrievalSource};
use serde_json::{Map, Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Inputs to one retrieval.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalRequest<'a> {
    pub query: &'a str,
    pub embedding: &'a [f32],
    pub top_k: usize,
    pub similarity_floor: f32,
}

/// Fused results plus what happened to each source.
#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
    pub results: Vec<FusedResult>,
    /// Set when only one index answered; names the one that did.
    pub single_source: Option<RetrievalSource>,
    pub semantic_count: usize,
    pub lexical_count: usize,
    pub semantic_error: Option<String>,
    pub lexical_error: Option<String>,
}

impl RetrievalOutcome {
    pub fn degraded(&self) -> bool {
        self.single_source.is_some()
    }

    /// Best cosine similarity among the results, 0.0 when empty.
    pub fn best_similarity(&self) -> f32 {
        self.results
            .iter()
            .map(|r| r.similarity)
            .fold(0.0_f32, f32::max)
    }

    /// Stage metadata recorded on the run.
    pub fn metadata(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("documents".into(), json!(self.results.len()));
        map.insert("semantic_candidates".into(), json!(self.semantic_count));
        map.insert("lexical_candidates".into(), json!(self.lexical_count));
        if let Some(source) = self.single_source {
            map.insert("single_source".into(), json!(source.to_string()));
        }
        if let Some(e) = &self.semantic_error {
            map.insert("semantic_error".into(), json!(e));
        }
        if let Some(e) = &self.lexical_error {
            map.insert("lexical_error".into(), json!(e));
        }
        map
    }
}

/// Runs both indexes and fuses their rankings.
#[derive(Clone)]
pub struct RetrievalStage {
    vector: Arc<dyn VectorIndex>,
    lexical: Arc<dyn LexicalIndex>,
    fusion: RankFusion,
    fetch_multiplier: usize,
    index_timeout: Duration,
}

impl RetrievalStage {
    pub fn new(
        vector: Arc<dyn VectorIndex>,
        lexical: Arc<dyn LexicalIndex>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            vector,
            lexical,
            fusion: RankFusion::new(config.rrf_k, config.lexical_weight),
            fetch_multiplier: config.fetch_multiplier.max(1),
            index_timeout: Duration::from_millis(config.index_timeout_ms),
        }
    }

    pub fn fusion(&self) -> &RankFusion {
        &self.fusion
    }

    pub async fn retrieve(
        &self,
        request: RetrievalRequest<'_>,
    ) -> Result<RetrievalOutcome, SearchError> {
        let fetch = request.top_k.saturating_mul(self.fetch_multiplier);

        let (semantic, lexical) = tokio::join!(
            bounded(
                "semantic",
                self.index_timeout,
                self.vector
                    .search(request.embedding, fetch, request.similarity_floor),
            ),
            bounded(
                "lexical",
                self.index_timeout,
                self.lexical.search(request.query, fetch),
            ),
        );

        let (semantic, semantic_error) = split(semantic, fetch);
        let (lexical, lexical_error) = split(lexical, fetch);

        let single_source = match (&semantic_error, &lexical_error) {
            (Some(s), Some(l)) => {
                return Err(SearchError::AllSourcesFailed {
                    semantic: s.clone(),
                    lexical: l.clone(),
                });
            }
            (Some(e), None) => {
                warn!(error = %e, "Semantic search failed, continuing with lexical only");
                Some(RetrievalSource::Lexical)
            }
            (None, Some(e)) => {
                warn!(error = %e, "Lexical search failed, continuing with semantic only");
                Some(RetrievalSource::Semantic)
            }
            (None, None) => None,
        };

        let mut results = self.fusion.fuse(&semantic, &lexical, request.top_k);
        for result in &mut results {
            result.similarity = cosine_similarity(request.embedding, &result.document.embedding);
        }

        debug!(
            query_len = request.query.len(),
            semantic = semantic.len(),
            lexical = lexical.len(),
            fused = results.len(),
            "Retrieval complete"
        );

        Ok(RetrievalOutcome {
            results,
            single_source,
            semantic_count: semantic.len(),
            lexical_count: lexical.len(),
            semantic_error,
            lexical_error,
        })
    }
}

impl std::fmt::Debug for RetrievalStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalStage")
            .field("fusion", &self.fusion)
            .field("fetch_multiplier", &self.fetch_multiplier)
            .field("index_timeout", &self.index_timeout)
            .finish()
    }
}

async fn bounded<F>(
    source_name: &str,
    timeout: Duration,
    search: F,
) -> Result<Vec<RetrievalCandidate>, SearchError>
where
    F: Future<Output = Result<Vec<RetrievalCandidate>, SearchError>>,
{
    match tokio::time::timeout(timeout, search).await {
        Ok(result) => result,
        Err(_) => Err(SearchError::Timeout {
            source_name: source_name.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

fn split(
    result: Result<Vec<RetrievalCandidate>, SearchError>,
    fetch: usize,
) -> (Vec<RetrievalCandidate>, Option<String>) {
    match result {
        Ok(mut candidates) => {
            candidates.truncate(fetch);
            (candidates, None)
        }
        Err(e) => (Vec::new(), Some(e.to_string())),
    }
}
