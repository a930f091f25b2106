//! Prepared corpus loading.
//!
//! Reads pre-chunked documents from a JSON array or JSON Lines file, embeds
//! any document that arrives without a vector, and builds both indexes.
//! Chunking and ingestion happen upstream.

use crate::embeddings::Embedder;
use crate::error::{QaError, SearchError};
use crate::search::{InMemoryVectorIndex, LexicalIndex, TantivyLexicalIndex, VectorIndex};
use crate::types::Document;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// A loaded corpus with both indexes built over it.
pub struct Corpus {
    documents: Vec<Arc<Document>>,
    vector: Arc<InMemoryVectorIndex>,
    lexical: Arc<TantivyLexicalIndex>,
}

impl Corpus {
    /// Read, embed and index a corpus file.
    pub async fn load(path: &Path, embedder: &dyn Embedder) -> Result<Self, QaError> {
        let documents = read_documents(path)?;
        info!(path = %path.display(), documents = documents.len(), "Corpus file read");
        Self::build(documents, embedder).await
    }

    /// Embed documents lacking a vector, then build both indexes.
    pub async fn build(documents: Vec<Document>, embedder: &dyn Embedder) -> Result<Self, QaError> {
        let expected = embedder.dimensions();
        let mut embedded = 0usize;
        let mut prepared = Vec::with_capacity(documents.len());

        for mut document in documents {
            if document.embedding.is_empty() {
                document.embedding = embedder.embed(&document.lexical_text()).await?.vector;
                embedded += 1;
            }
            if document.embedding.len() != expected {
                return Err(SearchError::DimensionMismatch {
                    expected,
                    actual: document.embedding.len(),
                }
                .into());
            }
            prepared.push(Arc::new(document));
        }

        let vector = InMemoryVectorIndex::build(&prepared)?;
        let lexical = TantivyLexicalIndex::build(&prepared)?;
        info!(
            documents = prepared.len(),
            embedded,
            dimensions = expected,
            embedder = embedder.provider_name(),
            "Corpus indexed"
        );

        Ok(Self {
            documents: prepared,
            vector: Arc::new(vector),
            lexical: Arc::new(lexical),
        })
    }

    pub fn documents(&self) -> &[Arc<Document>] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn vector_index(&self) -> Arc<dyn VectorIndex> {
        self.vector.clone()
    }

    pub fn lexical_index(&self) -> Arc<dyn LexicalIndex> {
        self.lexical.clone()
    }
}

impl std::fmt::Debug for Corpus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Corpus")
            .field("documents", &self.documents.len())
            .field("dimensions", &self.vector.dimensions())
            .finish()
    }
}

/// Parse a corpus file. A file whose first non-blank character is `[` is a
/// JSON array; anything else is read as JSON Lines.
pub fn read_documents(path: &Path) -> Result<Vec<Document>, QaError> {
    let raw = std::fs::read_to_string(path)?;
    parse_documents(&raw).map_err(QaError::from)
}

pub fn parse_documents(raw: &str) -> Result<Vec<Document>, SearchError> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| SearchError::Corpus(format!("invalid corpus JSON: {e}")));
    }

    let mut documents = Vec::new();
    for (number, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let document: Document = serde_json::from_str(line)
            .map_err(|e| SearchError::Corpus(format!("line {}: {e}", number + 1)))?;
        documents.push(document);
    }
    debug!(documents = documents.len(), "Parsed JSON Lines corpus");
    Ok(documents)
}
