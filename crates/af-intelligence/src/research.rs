//! Retrieval seam used by the researcher agent.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    #[error("retrieval backend unavailable: {0}")]
    Unavailable(String),
    #[error("retrieval failed: {0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, ResearchError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    /// Origin of the document (a domain, a repository, a dataset name).
    pub source: String,
    pub title: String,
    pub content: String,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            title: title.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedDocument {
    pub document: Document,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub id: String,
    pub source: String,
    pub title: String,
    pub snippet: String,
}

/// Lowercase alphanumeric terms of at least three characters.
pub fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(str::to_lowercase)
        .collect()
}

/// Fraction of `query` terms present in `text`. Zero for an empty query.
pub fn term_overlap(query: &str, text: &str) -> f64 {
    let wanted = terms(query);
    if wanted.is_empty() {
        return 0.0;
    }
    let have = terms(text);
    let hits = wanted.iter().filter(|t| have.contains(*t)).count();
    hits as f64 / wanted.len() as f64
}

const SNIPPET_CHARS: usize = 200;

/// Retrieve, rank, and cite evidence for a query.
///
/// Only `retrieve` is required. The default ranking is term overlap between
/// the query and the title plus content, highest first.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str) -> Result<Vec<Document>>;

    async fn rank(&self, documents: Vec<Document>, query: &str) -> Result<Vec<RankedDocument>> {
        let mut ranked: Vec<RankedDocument> = documents
            .into_iter()
            .map(|document| {
                let score =
                    term_overlap(query, &format!("{} {}", document.title, document.content));
                RankedDocument { document, score }
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(ranked)
    }

    fn build_citations(&self, ranked: &[RankedDocument]) -> Vec<Citation> {
        ranked
            .iter()
            .map(|r| Citation {
                id: r.document.id.clone(),
                source: r.document.source.clone(),
                title: r.document.title.clone(),
                snippet: r.document.content.chars().take(SNIPPET_CHARS).collect(),
            })
            .collect()
    }
}

/// Fixed corpus; `retrieve` returns documents sharing at least one term
/// with the query.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRetriever {
    corpus: Vec<Document>,
}

impl InMemoryRetriever {
    pub fn new(corpus: Vec<Document>) -> Self {
        Self { corpus }
    }
}

#[async_trait]
impl Retriever for InMemoryRetriever {
    async fn retrieve(&self, query: &str) -> Result<Vec<Document>> {
        let wanted = terms(query);
        Ok(self
            .corpus
            .iter()
            .filter(|doc| {
                let have = terms(&format!("{} {}", doc.title, doc.content));
                !wanted.is_disjoint(&have)
            })
            .cloned()
            .collect())
    }
}
