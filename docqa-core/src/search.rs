//! # Corpus indexes
//!
//! The retrieval stage consumes two ranked-lookup capabilities:
//! - [`LexicalIndex`]: keyword relevance, shipped as a Tantivy BM25 index
//! - [`VectorIndex`]: embedding similarity, shipped as a brute-force cosine index
//!
//! Both return candidates with 1-based ranks in their own score order. Equal
//! scores are ordered by document id so rankings are reproducible.

use crate::embeddings::cosine_similarity;
use crate::error::SearchError;
use crate::types::{Document, RetrievalCandidate, RetrievalSource};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, STORED, STRING, Schema, TEXT, Value};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, doc};

/// Keyword search over the corpus.
#[async_trait]
pub trait LexicalIndex: Send + Sync {
    async fn search(&self, query: &str, limit: usize)
    -> Result<Vec<RetrievalCandidate>, SearchError>;
}

/// Similarity search over document embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Candidates scoring below `similarity_floor` are not returned.
    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        similarity_floor: f32,
    ) -> Result<Vec<RetrievalCandidate>, SearchError>;
}

/// Sort scored hits descending, ties by document id ascending.
fn sort_hits(hits: &mut [(Arc<Document>, f32)]) {
    hits.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.id.cmp(&b.0.id))
    });
}

// ---------------------------------------------------------------------------
// Tantivy BM25
// ---------------------------------------------------------------------------

/// In-process Tantivy index over each document's lexical text.
pub struct TantivyLexicalIndex {
    index: Index,
    reader: IndexReader,
    id_field: Field,
    text_field: Field,
    documents: HashMap<String, Arc<Document>>,
}

impl std::fmt::Debug for TantivyLexicalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TantivyLexicalIndex")
            .field("indexed_count", &self.documents.len())
            .finish()
    }
}

impl TantivyLexicalIndex {
    /// Build an in-memory index from the corpus.
    pub fn build(documents: &[Arc<Document>]) -> Result<Self, SearchError> {
        let mut schema_builder = Schema::builder();
        let id_field = schema_builder.add_text_field("id", STRING | STORED);
        let text_field = schema_builder.add_text_field("text", TEXT);
        let schema = schema_builder.build();

        let index = Index::create_in_ram(schema);
        let mut writer: IndexWriter = index
            .writer_with_num_threads(1, 50_000_000)
            .map_err(|e| SearchError::IndexError(format!("Failed to create writer: {e}")))?;

        let mut by_id = HashMap::with_capacity(documents.len());
        for document in documents {
            if by_id.contains_key(&document.id) {
                return Err(SearchError::Corpus(format!(
                    "duplicate document id '{}'",
                    document.id
                )));
            }
            writer
                .add_document(doc!(
                    id_field => document.id.as_str(),
                    text_field => document.lexical_text(),
                ))
                .map_err(|e| SearchError::IndexError(format!("Failed to add document: {e}")))?;
            by_id.insert(document.id.clone(), Arc::clone(document));
        }

        writer
            .commit()
            .map_err(|e| SearchError::IndexError(format!("Failed to commit: {e}")))?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e| SearchError::IndexError(format!("Failed to create reader: {e}")))?;
        reader
            .reload()
            .map_err(|e| SearchError::IndexError(format!("Failed to reload reader: {e}")))?;

        tracing::debug!(documents = by_id.len(), "Lexical index built");

        Ok(Self {
            index,
            reader,
            id_field,
            text_field,
            documents: by_id,
        })
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn search_sync(&self, query: &str, limit: usize) -> Result<Vec<RetrievalCandidate>, SearchError> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let query_parser = QueryParser::for_index(&self.index, vec![self.text_field]);
        // Lenient parsing: natural-language questions contain `?`, `:` and quotes.
        let (parsed, _errors) = query_parser.parse_query_lenient(query);

        let top_docs = searcher
            .search(&parsed, &TopDocs::with_limit(limit))
            .map_err(|e| SearchError::QueryError(format!("Search failed: {e}")))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let stored: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| SearchError::IndexError(format!("Failed to retrieve doc: {e}")))?;
            let Some(id) = stored.get_first(self.id_field).and_then(|v| v.as_str()) else {
                continue;
            };
            if let Some(document) = self.documents.get(id) {
                hits.push((Arc::clone(document), score));
            }
        }

        sort_hits(&mut hits);
        Ok(RetrievalCandidate::ranked(hits, RetrievalSource::Lexical))
    }
}

#[async_trait]
impl LexicalIndex for TantivyLexicalIndex {
    async fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<RetrievalCandidate>, SearchError> {
        self.search_sync(query, limit)
    }
}

// ---------------------------------------------------------------------------
// Brute-force cosine
// ---------------------------------------------------------------------------

/// Exhaustive cosine-similarity index held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryVectorIndex {
    documents: Vec<Arc<Document>>,
    dimensions: usize,
}

impl InMemoryVectorIndex {
    /// Every document must carry an embedding of the same length.
    pub fn build(documents: &[Arc<Document>]) -> Result<Self, SearchError> {
        let dimensions = documents.first().map(|d| d.embedding.len()).unwrap_or(0);
        for document in documents {
            if document.embedding.is_empty() {
                return Err(SearchError::Corpus(format!(
                    "document '{}' has no embedding",
                    document.id
                )));
            }
            if document.embedding.len() != dimensions {
                return Err(SearchError::DimensionMismatch {
                    expected: dimensions,
                    actual: document.embedding.len(),
                });
            }
        }
        Ok(Self {
            documents: documents.to_vec(),
            dimensions,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn search(
        &self,
        embedding: &[f32],
        limit: usize,
        similarity_floor: f32,
    ) -> Result<Vec<RetrievalCandidate>, SearchError> {
        if self.documents.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        if embedding.len() != self.dimensions {
            return Err(SearchError::DimensionMismatch {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }

        let mut hits: Vec<(Arc<Document>, f32)> = self
            .documents
            .iter()
            .map(|d| (Arc::clone(d), cosine_similarity(embedding, &d.embedding)))
            .filter(|(_, score)| *score >= similarity_floor)
            .collect();

        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(RetrievalCandidate::ranked(hits, RetrievalSource::Semantic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::LocalEmbedder;

    fn corpus() -> Vec<Arc<Document>> {
        let embedder = LocalEmbedder::new(128);
        [
            ("pg-backups", "Postgres", "Postgres databases include automated daily backups."),
            ("pg-plans", "Postgres Plans", "Postgres instance types are Free, Basic and Pro."),
            ("kv-plans", "Key Value", "Key Value instances offer Free, Starter and Pro plans."),
            ("cron", "Cron Jobs", "Cron jobs run a command on a schedule."),
        ]
        .into_iter()
        .map(|(id, title, content)| {
            let doc = Document::new(id, title, format!("https://docs/{id}"), content);
            let embedding = embedder.embed_text(&doc.lexical_text());
            Arc::new(doc.with_embedding(embedding))
        })
        .collect()
    }

    #[tokio::test]
    async fn test_lexical_search_ranks_matching_documents() {
        let index = TantivyLexicalIndex::build(&corpus()).unwrap();
        assert_eq!(index.len(), 4);

        let results = index.search("postgres backups", 10).await.unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].document.id, "pg-backups");
        assert_eq!(results[0].rank, 1);
        assert_eq!(results[0].source, RetrievalSource::Lexical);
        assert!(results.iter().all(|c| c.document.id != "cron"));
    }

    #[tokio::test]
    async fn test_lexical_search_tolerates_punctuation() {
        let index = TantivyLexicalIndex::build(&corpus()).unwrap();
        let results = index.search("What plans does Key Value offer?", 10).await.unwrap();
        assert_eq!(results[0].document.id, "kv-plans");
    }

    #[tokio::test]
    async fn test_lexical_search_empty_query() {
        let index = TantivyLexicalIndex::build(&corpus()).unwrap();
        assert!(index.search("   ", 10).await.unwrap().is_empty());
        assert!(index.search("postgres", 0).await.unwrap().is_empty());
    }

    #[test]
    fn test_lexical_build_rejects_duplicate_ids() {
        let mut docs = corpus();
        docs.push(Arc::clone(&docs[0]));
        let err = TantivyLexicalIndex::build(&docs).unwrap_err();
        assert!(matches!(err, SearchError::Corpus(_)));
    }

    #[tokio::test]
    async fn test_vector_search_respects_floor_and_limit() {
        let docs = corpus();
        let index = InMemoryVectorIndex::build(&docs).unwrap();
        let query = LocalEmbedder::new(128).embed_text("Postgres daily backups");

        let results = index.search(&query, 2, 0.0).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].document.id, "pg-backups");
        assert!(results[0].score >= results[1].score);

        let strict = index.search(&query, 10, 0.99).await.unwrap();
        assert!(strict.iter().all(|c| c.score >= 0.99));
    }

    #[tokio::test]
    async fn test_vector_search_dimension_mismatch() {
        let index = InMemoryVectorIndex::build(&corpus()).unwrap();
        let err = index.search(&[1.0, 0.0], 5, 0.0).await.unwrap_err();
        assert!(matches!(
            err,
            SearchError::DimensionMismatch {
                expected: 128,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_vector_ties_broken_by_id() {
        let docs: Vec<Arc<Document>> = ["b", "a", "c"]
            .into_iter()
            .map(|id| Arc::new(Document::new(id, "t", "s", "c").with_embedding(vec![1.0, 0.0])))
            .collect();
        let index = InMemoryVectorIndex::build(&docs).unwrap();
        let results = index.search(&[1.0, 0.0], 3, 0.0).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|c| c.document.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_vector_build_requires_embeddings() {
        let docs = vec![Arc::new(Document::new("x", "t", "s", "c"))];
        assert!(matches!(
            InMemoryVectorIndex::build(&docs),
            Err(SearchError::Corpus(_))
        ));
    }
}
