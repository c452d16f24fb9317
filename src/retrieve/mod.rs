//! Query-time retrieval
//!
//! Embeds the query with the same generator used at ingestion, scans the
//! last promoted index snapshot, and ranks the records.

use crate::config::RetrievalConfig;
use crate::embed::EmbeddingGenerator;
use crate::error::{Error, Result};
use crate::index::{IndexSnapshot, VectorIndex};
use crate::models::{Metadata, VectorRecord};
use crate::rank::Ranker;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub use crate::rank::ScoredRecord;

/// Retrieval options
#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    /// Number of results to return
    pub top_k: usize,
    /// Drop results scoring below this value (applied after truncation)
    pub score_threshold: Option<f32>,
    /// Record metadata must equal these values
    pub filters: Metadata,
    /// Keep only the best chunk per document
    pub dedupe_by_document: bool,
    /// BM25 weight in [0, 1]; 0 ranks by cosine only
    pub hybrid_weight: f32,
}

impl RetrieveOptions {
    pub fn new(top_k: usize) -> Self {
        Self {
            top_k,
            score_threshold: None,
            filters: Metadata::new(),
            dedupe_by_document: false,
            hybrid_weight: 0.0,
        }
    }

    /// Defaults from the retrieval configuration
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            top_k: config.default_top_k,
            score_threshold: config.score_threshold,
            filters: Metadata::new(),
            dedupe_by_document: config.dedupe_by_document,
            hybrid_weight: config.hybrid_weight,
        }
    }

    pub fn with_threshold(mut self, threshold: Option<f32>) -> Self {
        self.score_threshold = threshold;
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    pub fn with_dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe_by_document = dedupe;
        self
    }

    pub fn with_hybrid_weight(mut self, weight: f32) -> Self {
        self.hybrid_weight = weight;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(Error::InvalidArgument("top_k must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.hybrid_weight) {
            return Err(Error::InvalidArgument(format!(
                "hybrid_weight must be between 0.0 and 1.0, got {}",
                self.hybrid_weight
            )));
        }
        Ok(())
    }

    fn matches(&self, record: &VectorRecord) -> bool {
        self.filters
            .iter()
            .all(|(key, value)| record.metadata.get(key) == Some(value))
    }
}

/// What a retrieval consumer receives for each result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub text: String,
    pub score: f32,
    pub metadata: Metadata,
    pub document_id: Uuid,
    pub chunk_id: Uuid,
}

impl From<ScoredRecord> for RetrievalHit {
    fn from(scored: ScoredRecord) -> Self {
        Self {
            text: scored.record.text.clone(),
            score: scored.score,
            metadata: scored.record.metadata.clone(),
            document_id: scored.record.document_id,
            chunk_id: scored.record.chunk_id,
        }
    }
}

/// Similarity search over a [`VectorIndex`]
pub struct Retriever {
    generator: Arc<EmbeddingGenerator>,
    index: Arc<VectorIndex>,
}

impl Retriever {
    pub fn new(generator: Arc<EmbeddingGenerator>, index: Arc<VectorIndex>) -> Self {
        Self { generator, index }
    }

    /// Top `top_k` records by cosine similarity, dropping those under the threshold
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredRecord>> {
        self.retrieve_with(query, &RetrieveOptions::new(top_k).with_threshold(score_threshold))
            .await
    }

    pub async fn retrieve_with(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> Result<Vec<ScoredRecord>> {
        options.validate()?;
        if query.trim().is_empty() {
            return Err(Error::InvalidArgument("query text is empty".to_string()));
        }

        let snapshot = self.index.snapshot();
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(declared) = snapshot.dimension() {
            if declared != self.generator.dimension() {
                return Err(Error::DimensionMismatch {
                    expected: declared,
                    actual: self.generator.dimension(),
                });
            }
        }

        let query_vector = self.generator.embed(query).await?;
        rank_snapshot(&snapshot, &query_vector, query, options)
    }

    /// Same as [`retrieve_with`](Self::retrieve_with), shaped for consumers
    pub async fn search(&self, query: &str, options: &RetrieveOptions) -> Result<Vec<RetrievalHit>> {
        Ok(self
            .retrieve_with(query, options)
            .await?
            .into_iter()
            .map(RetrievalHit::from)
            .collect())
    }
}

/// Rank a snapshot against an already embedded query.
///
/// Order of operations: filter, score, sort, dedupe, truncate to `top_k`,
/// then apply the threshold.
pub fn rank_snapshot(
    snapshot: &IndexSnapshot,
    query_vector: &[f32],
    query_text: &str,
    options: &RetrieveOptions,
) -> Result<Vec<ScoredRecord>> {
    options.validate()?;

    if let Some(declared) = snapshot.dimension() {
        if declared != query_vector.len() {
            return Err(Error::DimensionMismatch {
                expected: declared,
                actual: query_vector.len(),
            });
        }
    }

    let ranker = Ranker::new(options.hybrid_weight);
    let candidates = ranker.score_vectors(
        query_vector,
        snapshot.records().filter(|r| options.matches(r)),
    );
    let scanned = candidates.len();

    let mut ranked = if ranker.is_hybrid() {
        ranker.rank_hybrid(candidates, query_text)
    } else {
        ranker.rank_vector_only(candidates)
    };

    if options.dedupe_by_document {
        ranked = ranker.dedupe_by_document(ranked);
    }
    ranked.truncate(options.top_k);
    if let Some(threshold) = options.score_threshold {
        ranked = ranker.filter_by_score(ranked, threshold);
    }

    debug!(scanned, returned = ranked.len(), "Ranked index snapshot");
    Ok(ranked)
}
