//! Result ranking and hybrid retrieval
//!
//! This module handles:
//! - Scoring vector records against a unit query vector
//! - Deterministic ordering (score descending, chunk id ascending)
//! - Optional BM25 keyword scoring blended into the vector score
//! - Per-document deduplication and score thresholds

use crate::models::VectorRecord;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A vector record with its ranking scores
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: Arc<VectorRecord>,
    /// Final score used for ordering
    pub score: f32,
    /// Cosine similarity to the query
    pub vector_score: f32,
    /// Normalized BM25 score, when hybrid ranking ran
    pub bm25_score: Option<f32>,
}

impl ScoredRecord {
    pub fn new(record: Arc<VectorRecord>, vector_score: f32) -> Self {
        Self {
            record,
            score: vector_score,
            vector_score,
            bm25_score: None,
        }
    }
}

/// Dot product; equals cosine similarity for unit vectors
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Score descending, then chunk id ascending
pub fn compare_scored(a: &ScoredRecord, b: &ScoredRecord) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.record.chunk_id.cmp(&b.record.chunk_id))
}

/// Rank and merge search results
pub struct Ranker {
    bm25_weight: f32,
    vector_weight: f32,
}

impl Ranker {
    /// Create a new ranker; `bm25_weight` is clamped to [0, 1]
    pub fn new(bm25_weight: f32) -> Self {
        let bm25_weight = bm25_weight.clamp(0.0, 1.0);
        Self {
            bm25_weight,
            vector_weight: 1.0 - bm25_weight,
        }
    }

    pub fn is_hybrid(&self) -> bool {
        self.bm25_weight > 0.0
    }

    /// Score every record against the query vector
    pub fn score_vectors<'a>(
        &self,
        query: &[f32],
        records: impl IntoIterator<Item = &'a Arc<VectorRecord>>,
    ) -> Vec<ScoredRecord> {
        records
            .into_iter()
            .map(|r| ScoredRecord::new(r.clone(), dot(query, &r.embedding)))
            .collect()
    }

    /// Rank results using vector scores only
    pub fn rank_vector_only(&self, mut results: Vec<ScoredRecord>) -> Vec<ScoredRecord> {
        results.sort_by(compare_scored);
        results
    }

    /// Blend BM25 scores (normalized to [0, 1] over the candidates) into the
    /// vector scores, then rank
    pub fn rank_hybrid(&self, results: Vec<ScoredRecord>, query: &str) -> Vec<ScoredRecord> {
        let scorer = Bm25Scorer::new();
        let terms = scorer.tokenize(query);
        let texts: Vec<&str> = results.iter().map(|r| r.record.text.as_str()).collect();
        let raw = scorer.score_corpus(&terms, &texts);
        let max = raw.iter().copied().fold(0.0f32, f32::max);

        let results = results
            .into_iter()
            .zip(raw)
            .map(|(mut result, bm25)| {
                let bm25 = if max > 0.0 { bm25 / max } else { 0.0 };
                result.bm25_score = Some(bm25);
                result.score = self.vector_weight * result.vector_score + self.bm25_weight * bm25;
                result
            })
            .collect();

        self.rank_vector_only(results)
    }

    /// Filter results by minimum score
    pub fn filter_by_score(&self, results: Vec<ScoredRecord>, min_score: f32) -> Vec<ScoredRecord> {
        results.into_iter().filter(|r| r.score >= min_score).collect()
    }

    /// Keep the best chunk per document; input must already be ranked
    pub fn dedupe_by_document(&self, results: Vec<ScoredRecord>) -> Vec<ScoredRecord> {
        let mut seen = HashSet::new();
        results
            .into_iter()
            .filter(|r| seen.insert(r.record.document_id))
            .collect()
    }
}

/// BM25 over a candidate set
pub struct Bm25Scorer {
    k1: f32,
    b: f32,
}

impl Bm25Scorer {
    pub fn new() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }

    /// Score every document in `docs` against the query terms, using the
    /// set itself for document frequencies and average length
    pub fn score_corpus(&self, query_terms: &[String], docs: &[&str]) -> Vec<f32> {
        if docs.is_empty() || query_terms.is_empty() {
            return vec![0.0; docs.len()];
        }

        let tokenized: Vec<Vec<String>> = docs.iter().map(|d| self.tokenize(d)).collect();
        let n = docs.len() as f32;
        let avg_len = tokenized.iter().map(Vec::len).sum::<usize>() as f32 / n;

        let unique_terms: HashSet<&String> = query_terms.iter().collect();
        let idf: HashMap<&String, f32> = unique_terms
            .into_iter()
            .map(|term| {
                let df = tokenized.iter().filter(|tokens| tokens.contains(term)).count() as f32;
                (term, (1.0 + (n - df + 0.5) / (df + 0.5)).ln())
            })
            .collect();

        tokenized
            .iter()
            .map(|tokens| self.score_tokens(query_terms, tokens, avg_len, &idf))
            .collect()
    }

    fn score_tokens(
        &self,
        query_terms: &[String],
        tokens: &[String],
        avg_len: f32,
        idf: &HashMap<&String, f32>,
    ) -> f32 {
        let doc_len = tokens.len() as f32;
        let mut total_score = 0.0;

        for term in query_terms {
            let tf = tokens.iter().filter(|t| *t == term).count() as f32;
            if tf > 0.0 {
                let idf = idf.get(term).copied().unwrap_or(0.0);
                let norm = if avg_len > 0.0 { doc_len / avg_len } else { 1.0 };
                let numerator = tf * (self.k1 + 1.0);
                let denominator = tf + self.k1 * (1.0 - self.b + self.b * norm);
                total_score += idf * (numerator / denominator);
            }
        }

        total_score
    }

    /// Lowercased whitespace tokens with surrounding punctuation trimmed.
    /// Inner punctuation stays, so `CVE-2021-44228` and `10.0.0.1` are one term each.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        text.split_whitespace()
            .map(|s| s.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|s| s.chars().count() >= 2)
            .collect()
    }
}

impl Default for Bm25Scorer {
    fn default() -> Self {
        Self::new()
    }
}
