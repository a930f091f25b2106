//! Reciprocal Rank Fusion.
//!
//! Merges the semantic and lexical rankings into one list using only rank
//! positions, so raw scores on incompatible scales never meet:
//!
//! ```text
//! rrf(rank)  = 1 / (K + rank)
//! combined   = (1 - w) * rrf(semantic_rank) + w * rrf(lexical_rank)
//! ```
//!
//! A document absent from a list contributes 0 for that list. Output is
//! sorted by combined score descending, then by the best rank the document
//! reached in either list, then by document id.

use crate::types::{Document, FusedResult, RetrievalCandidate};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Default RRF smoothing constant.
pub const DEFAULT_RRF_K: f64 = 60.0;

/// Fusion parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankFusion {
    k: f64,
    lexical_weight: f64,
}

impl Default for RankFusion {
    fn default() -> Self {
        Self {
            k: DEFAULT_RRF_K,
            lexical_weight: 0.4,
        }
    }
}

impl RankFusion {
    /// `lexical_weight` is clamped into [0, 1]; NaN is treated as 0.
    pub fn new(k: f64, lexical_weight: f64) -> Self {
        let lexical_weight = if lexical_weight.is_nan() {
            0.0
        } else {
            lexical_weight.clamp(0.0, 1.0)
        };
        let k = if k.is_finite() && k > 0.0 { k } else { DEFAULT_RRF_K };
        Self { k, lexical_weight }
    }

    pub fn k(&self) -> f64 {
        self.k
    }

    pub fn lexical_weight(&self) -> f64 {
        self.lexical_weight
    }

    /// Reciprocal-rank contribution of a 1-based rank.
    pub fn rrf(&self, rank: usize) -> f64 {
        1.0 / (self.k + rank as f64)
    }

    /// Fuse two ranked lists and keep the best `top_k`.
    ///
    /// Rank is the 1-based position in each input slice. A document repeated
    /// within one list keeps its first position. `similarity` on the output is
    /// left at 0.0 for the caller to annotate.
    pub fn fuse(
        &self,
        semantic: &[RetrievalCandidate],
        lexical: &[RetrievalCandidate],
        top_k: usize,
    ) -> Vec<FusedResult> {
        let mut entries: HashMap<&str, Entry> = HashMap::new();

        for (position, candidate) in semantic.iter().enumerate() {
            let entry = entries
                .entry(candidate.document.id.as_str())
                .or_insert_with(|| Entry::new(&candidate.document));
            entry.semantic_rank.get_or_insert(position + 1);
        }
        for (position, candidate) in lexical.iter().enumerate() {
            let entry = entries
                .entry(candidate.document.id.as_str())
                .or_insert_with(|| Entry::new(&candidate.document));
            entry.lexical_rank.get_or_insert(position + 1);
        }

        let semantic_weight = 1.0 - self.lexical_weight;
        let mut fused: Vec<FusedResult> = entries
            .into_values()
            .map(|entry| {
                let semantic_score = entry.semantic_rank.map(|r| self.rrf(r)).unwrap_or(0.0);
                let lexical_score = entry.lexical_rank.map(|r| self.rrf(r)).unwrap_or(0.0);
                FusedResult {
                    document: entry.document,
                    combined_score: semantic_weight * semantic_score
                        + self.lexical_weight * lexical_score,
                    semantic_rank: entry.semantic_rank,
                    lexical_rank: entry.lexical_rank,
                    similarity: 0.0,
                }
            })
            .collect();

        fused.sort_by(compare_fused);
        fused.truncate(top_k);
        fused
    }
}

struct Entry {
    document: Arc<Document>,
    semantic_rank: Option<usize>,
    lexical_rank: Option<usize>,
}

impl Entry {
    fn new(document: &Arc<Document>) -> Self {
        Self {
            document: Arc::clone(document),
            semantic_rank: None,
            lexical_rank: None,
        }
    }
}

/// Total order used for fused output.
pub fn compare_fused(a: &FusedResult, b: &FusedResult) -> Ordering {
    b.combined_score
        .partial_cmp(&a.combined_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.min_rank().cmp(&b.min_rank()))
        .then_with(|| a.document.id.cmp(&b.document.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RetrievalSource;
    use pretty_assertions::assert_eq;

    fn doc(id: &str) -> Arc<Document> {
        Arc::new(Document::new(id, id, "src", "content"))
    }

    fn list(ids: &[&str], source: RetrievalSource) -> Vec<RetrievalCandidate> {
        RetrievalCandidate::ranked(
            ids.iter().map(|id| (doc(id), 1.0)).collect(),
            source,
        )
    }

    fn ids(results: &[FusedResult]) -> Vec<&str> {
        results.iter().map(|r| r.document.id.as_str()).collect()
    }

    #[test]
    fn test_disjoint_lists_equal_weight() {
        let fusion = RankFusion::new(60.0, 0.5);
        let semantic = list(&["A", "B"], RetrievalSource::Semantic);
        let lexical = list(&["C", "D"], RetrievalSource::Lexical);

        let fused = fusion.fuse(&semantic, &lexical, 10);
        assert_eq!(fused.len(), 4);
        // A and C tie at 0.5/61, broken by min rank (equal) then id.
        assert_eq!(ids(&fused), vec!["A", "C", "B", "D"]);

        let expected_a = 0.5 * (1.0 / 61.0);
        assert!((fused[0].combined_score - expected_a).abs() < 1e-12);
        assert!((fused[2].combined_score - 0.5 * (1.0 / 62.0)).abs() < 1e-12);
        assert_eq!(fused[0].semantic_rank, Some(1));
        assert_eq!(fused[0].lexical_rank, None);
        assert_eq!(fused[1].lexical_rank, Some(1));
    }

    #[test]
    fn test_exact_combined_score_for_shared_document() {
        let fusion = RankFusion::new(60.0, 0.4);
        let semantic = list(&["X", "Y"], RetrievalSource::Semantic);
        let lexical = list(&["Y", "Z", "X"], RetrievalSource::Lexical);

        let fused = fusion.fuse(&semantic, &lexical, 10);
        let y = fused.iter().find(|r| r.document.id == "Y").unwrap();
        let expected = 0.6 / 62.0 + 0.4 / 61.0;
        assert!((y.combined_score - expected).abs() < 1e-12);

        let x = fused.iter().find(|r| r.document.id == "X").unwrap();
        let expected = 0.6 / 61.0 + 0.4 / 63.0;
        assert!((x.combined_score - expected).abs() < 1e-12);
        // Y sits near the top of both lists and overtakes X.
        assert_eq!(ids(&fused)[..2], ["Y", "X"]);
    }

    #[test]
    fn test_deterministic_output() {
        let fusion = RankFusion::default();
        let semantic = list(&["d3", "d1", "d2", "d5"], RetrievalSource::Semantic);
        let lexical = list(&["d2", "d4", "d3"], RetrievalSource::Lexical);

        let first = ids(&fusion.fuse(&semantic, &lexical, 10))
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        for _ in 0..20 {
            let again: Vec<String> = ids(&fusion.fuse(&semantic, &lexical, 10))
                .into_iter()
                .map(String::from)
                .collect();
            assert_eq!(again, first);
        }
    }

    #[test]
    fn test_monotonic_in_rank() {
        let fusion = RankFusion::new(60.0, 0.3);
        let lexical = list(&["L1", "L2"], RetrievalSource::Lexical);

        let low = list(&["a", "b", "c", "d", "T"], RetrievalSource::Semantic);
        let high = list(&["T", "a", "b", "c", "d"], RetrievalSource::Semantic);

        let score_of = |results: Vec<FusedResult>| {
            results
                .into_iter()
                .find(|r| r.document.id == "T")
                .map(|r| r.combined_score)
                .unwrap()
        };
        let at_five = score_of(fusion.fuse(&low, &lexical, 10));
        let at_one = score_of(fusion.fuse(&high, &lexical, 10));
        assert!(at_one > at_five);
    }

    #[test]
    fn test_duplicate_keeps_first_position() {
        let fusion = RankFusion::new(60.0, 0.0);
        let semantic = list(&["A", "B", "A"], RetrievalSource::Semantic);
        let fused = fusion.fuse(&semantic, &[], 10);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].document.id, "A");
        assert_eq!(fused[0].semantic_rank, Some(1));
        assert!((fused[0].combined_score - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_weight_clamped() {
        assert_eq!(RankFusion::new(60.0, 1.7).lexical_weight(), 1.0);
        assert_eq!(RankFusion::new(60.0, -0.2).lexical_weight(), 0.0);
        assert_eq!(RankFusion::new(60.0, f64::NAN).lexical_weight(), 0.0);
        assert_eq!(RankFusion::new(-1.0, 0.5).k(), DEFAULT_RRF_K);
    }

    #[test]
    fn test_empty_inputs() {
        let fusion = RankFusion::default();
        assert!(fusion.fuse(&[], &[], 10).is_empty());

        let lexical = list(&["only"], RetrievalSource::Lexical);
        let fused = fusion.fuse(&[], &lexical, 10);
        assert_eq!(ids(&fused), vec!["only"]);
        assert!((fused[0].combined_score - 0.4 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_source_preserves_order() {
        let fusion = RankFusion::default();
        let semantic = list(&["s9", "s2", "s7", "s1"], RetrievalSource::Semantic);
        let fused = fusion.fuse(&semantic, &[], 10);
        assert_eq!(ids(&fused), vec!["s9", "s2", "s7", "s1"]);
    }

    #[test]
    fn test_truncates_to_top_k() {
        let fusion = RankFusion::default();
        let semantic = list(&["a", "b", "c", "d"], RetrievalSource::Semantic);
        let lexical = list(&["e", "f"], RetrievalSource::Lexical);
        assert_eq!(fusion.fuse(&semantic, &lexical, 3).len(), 3);
        assert!(fusion.fuse(&semantic, &lexical, 0).is_empty());
    }
}
