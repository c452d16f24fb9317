//! Embedding generation
//!
//! This module provides an abstraction over embedding models with:
//! - A trait for different embedding backends
//! - Hashing, HTTP and (feature-gated) FastEmbed backends
//! - [`EmbeddingGenerator`], which owns the contract every caller relies on:
//!   fixed dimension, unit-length vectors, timeouts, retries and per-item
//!   failure attribution in batches

mod domain;
#[cfg(feature = "local-embed")]
mod fastembed_impl;
mod hashing;
mod http_backend;

pub use domain::adapt_for_domain;
#[cfg(feature = "local-embed")]
pub use fastembed_impl::*;
pub use hashing::HashingEmbedder;
pub use http_backend::HttpEmbedder;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Scale a vector to unit length. The zero vector is returned unchanged.
pub fn normalize_embedding(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|v| v / norm).collect()
}

/// Trait for embedding providers
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input in input order
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.backend.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(
            config.model.clone(),
            config.dimension,
        )?)),
        "http" => Ok(Arc::new(HttpEmbedder::new(config)?)),
        #[cfg(feature = "local-embed")]
        "fastembed" => Ok(Arc::new(FastEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embed"))]
        "fastembed" => Err(Error::InvalidConfiguration(
            "fastembed backend requires building with --features local-embed".to_string(),
        )),
        other => Err(Error::InvalidConfiguration(format!(
            "Unsupported embedding backend '{}'; expected hashing, http or fastembed",
            other
        ))),
    }
}

/// Per-input outcome of [`EmbeddingGenerator::embed_batch`], in input order
#[derive(Debug)]
pub struct BatchEmbedding {
    pub items: Vec<Result<Vec<f32>>>,
}

impl BatchEmbedding {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn success_count(&self) -> usize {
        self.items.iter().filter(|r| r.is_ok()).count()
    }

    /// Input indices whose embedding failed
    pub fn failed_indices(&self) -> Vec<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_err())
            .map(|(i, _)| i)
            .collect()
    }
}

/// Wraps a backend with the embedding contract
pub struct EmbeddingGenerator {
    backend: Arc<dyn Embedder>,
    dimension: usize,
    batch_size: usize,
    timeout: Duration,
    max_retries: usize,
    retry_backoff: Duration,
    domain_adaptation: bool,
}

impl EmbeddingGenerator {
    /// Wrap `backend`; its dimension must equal the configured one
    pub fn new(backend: Arc<dyn Embedder>, config: &EmbeddingConfig) -> Result<Self> {
        if backend.dimension() != config.dimension {
            return Err(Error::DimensionMismatch {
                expected: config.dimension,
                actual: backend.dimension(),
            });
        }

        Ok(Self {
            backend,
            dimension: config.dimension,
            batch_size: config.batch_size.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            domain_adaptation: config.domain_adaptation,
        })
    }

    /// Build the configured backend and wrap it
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        Self::new(create_embedder(config)?, config)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    /// Embed a single text
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.call_with_retry(vec![self.prepare(text)]).await?;
        match vectors.pop() {
            Some(vector) => self.finish(vector),
            None => Err(Error::EmbeddingFailure(
                "Embedding backend returned no vector".to_string(),
            )),
        }
    }

    /// Embed many texts.
    ///
    /// Inputs go out in groups of `batch_size`. A failed group is retried
    /// item by item so that each failure is attributed to its input; the
    /// successes of a partially failed batch are kept.
    pub async fn embed_batch(&self, texts: &[String]) -> BatchEmbedding {
        let mut items = Vec::with_capacity(texts.len());

        for group in texts.chunks(self.batch_size) {
            let prepared: Vec<String> = group.iter().map(|t| self.prepare(t)).collect();

            match self.call_with_retry(prepared.clone()).await {
                Ok(vectors) => {
                    items.extend(vectors.into_iter().map(|v| self.finish(v)));
                }
                Err(e) if prepared.len() == 1 => items.push(Err(e)),
                Err(e) => {
                    warn!(
                        size = prepared.len(),
                        error = %e,
                        "Embedding batch failed, retrying items individually"
                    );
                    for text in prepared {
                        let result = self
                            .call_with_retry(vec![text])
                            .await
                            .and_then(|mut v| {
                                v.pop().ok_or_else(|| {
                                    Error::EmbeddingFailure(
                                        "Embedding backend returned no vector".to_string(),
                                    )
                                })
                            })
                            .and_then(|v| self.finish(v));
                        items.push(result);
                    }
                }
            }
        }

        BatchEmbedding { items }
    }

    fn prepare(&self, text: &str) -> String {
        if self.domain_adaptation {
            adapt_for_domain(text).into_owned()
        } else {
            text.to_string()
        }
    }

    /// Check the dimension and scale to unit length.
    ///
    /// A zero or non-finite vector has no direction and is rejected.
    fn finish(&self, vector: Vec<f32>) -> Result<Vec<f32>> {
        if vector.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if !norm.is_finite() || norm == 0.0 {
            return Err(Error::EmbeddingFailure(
                "Embedding backend returned a vector with no direction".to_string(),
            ));
        }
        Ok(normalize_embedding(&vector))
    }

    /// One backend call bounded by the timeout, retried with linear backoff
    async fn call_with_retry(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let expected = texts.len();
        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.max_retries {
            let outcome = tokio::time::timeout(self.timeout, self.backend.embed(texts.clone())).await;

            match outcome {
                Ok(Ok(vectors)) if vectors.len() == expected => return Ok(vectors),
                Ok(Ok(vectors)) => {
                    last_err = Some(Error::EmbeddingFailure(format!(
                        "Embedding backend returned {} vectors for {} inputs",
                        vectors.len(),
                        expected
                    )));
                }
                Ok(Err(e)) if !e.is_transient() => return Err(e),
                Ok(Err(e)) => last_err = Some(e),
                Err(_) => {
                    last_err = Some(Error::EmbeddingFailure(format!(
                        "Embedding call timed out after {:?}",
                        self.timeout
                    )));
                }
            }

            if attempt < self.max_retries {
                debug!(attempt = attempt + 1, "Retrying embedding call");
                tokio::time::sleep(self.retry_backoff * (attempt as u32 + 1)).await;
            }
        }

        Err(match last_err {
            Some(Error::EmbeddingFailure(msg)) => Error::EmbeddingFailure(msg),
            Some(other) => Error::EmbeddingFailure(other.to_string()),
            None => Error::EmbeddingFailure("Embedding backend request failed".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that fails any call containing a poisoned text and can fail
    /// the first N calls outright
    struct FlakyEmbedder {
        dimension: usize,
        poison: &'static str,
        fail_first: usize,
        calls: AtomicUsize,
    }

    impl FlakyEmbedder {
        fn new(poison: &'static str, fail_first: usize) -> Self {
            Self {
                dimension: 4,
                poison,
                fail_first,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(Error::EmbeddingFailure("temporarily unavailable".to_string()));
            }
            if texts.iter().any(|t| t.contains(self.poison)) {
                return Err(Error::EmbeddingFailure("rejected input".to_string()));
            }
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, 1.0, 0.0, 0.0])
                .collect())
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn model_name(&self) -> &str {
            "flaky"
        }
    }

    struct WrongDimension;

    #[async_trait]
    impl Embedder for WrongDimension {
        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 2.0]).collect())
        }

        fn dimension(&self) -> usize {
            4
        }

        fn model_name(&self) -> &str {
            "liar"
        }
    }

    fn config(dimension: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            dimension,
            batch_size: 3,
            timeout_secs: 5,
            max_retries: 2,
            retry_backoff_ms: 1,
            ..EmbeddingConfig::default()
        }
    }

    #[test]
    fn test_normalize_embedding() {
        let unit = normalize_embedding(&[3.0, 4.0]);
        assert!((unit[0] - 0.6).abs() < 1e-6);
        assert!((unit[1] - 0.8).abs() < 1e-6);
        assert_eq!(normalize_embedding(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_embed_is_unit_length() {
        let generator = EmbeddingGenerator::from_config(&config(32)).unwrap();
        let vector = generator.embed("CVE-2021-44228 Log4Shell").await.unwrap();
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();

        assert_eq!(vector.len(), 32);
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let backend = Arc::new(FlakyEmbedder::new("never", 2));
        let generator = EmbeddingGenerator::new(backend.clone(), &config(4)).unwrap();

        assert!(generator.embed("hello").await.is_ok());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let backend = Arc::new(FlakyEmbedder::new("never", 10));
        let generator = EmbeddingGenerator::new(backend.clone(), &config(4)).unwrap();

        let err = generator.embed("hello").await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingFailure(_)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_partial_batch_failure_attributed() {
        let backend = Arc::new(FlakyEmbedder::new("POISON", 0));
        let mut cfg = config(4);
        cfg.max_retries = 0;
        let generator = EmbeddingGenerator::new(backend, &cfg).unwrap();

        let texts: Vec<String> = ["a", "bb", "POISON", "ccc", "dddd"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let batch = generator.embed_batch(&texts).await;

        assert_eq!(batch.len(), 5);
        assert_eq!(batch.failed_indices(), vec![2]);
        assert_eq!(batch.success_count(), 4);
        // Order preserved: the vector encodes the input length
        let first = batch.items[1].as_ref().unwrap();
        let expected = normalize_embedding(&[2.0, 1.0, 0.0, 0.0]);
        assert_eq!(first, &expected);
    }

    #[tokio::test]
    async fn test_directionless_vector_rejected() {
        let generator = EmbeddingGenerator::from_config(&config(32)).unwrap();

        // No word or trigram features: the hashing backend yields all zeros
        assert!(matches!(
            generator.embed("---- !!! ====").await,
            Err(Error::EmbeddingFailure(_))
        ));

        let texts = vec!["CVE-2021-44228".to_string(), "---- !!! ====".to_string()];
        let batch = generator.embed_batch(&texts).await;
        assert_eq!(batch.failed_indices(), vec![1]);
        let norm: f32 = batch.items[0]
            .as_ref()
            .unwrap()
            .iter()
            .map(|v| v * v)
            .sum::<f32>()
            .sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_wrong_dimension_rejected() {
        let generator = EmbeddingGenerator::new(Arc::new(WrongDimension), &config(4)).unwrap();
        assert!(matches!(
            generator.embed("x").await,
            Err(Error::DimensionMismatch {
                expected: 4,
                actual: 2
            })
        ));

        let batch = generator.embed_batch(&["x".to_string()]).await;
        assert!(matches!(batch.items[0], Err(Error::DimensionMismatch { .. })));
    }

    #[test]
    fn test_backend_dimension_must_match_config() {
        let backend = Arc::new(FlakyEmbedder::new("never", 0));
        assert!(matches!(
            EmbeddingGenerator::new(backend, &config(8)),
            Err(Error::DimensionMismatch {
                expected: 8,
                actual: 4
            })
        ));
    }

    #[tokio::test]
    async fn test_domain_adaptation_applies_to_inputs() {
        let mut cfg = config(16);
        cfg.domain_adaptation = true;
        let adapted = EmbeddingGenerator::from_config(&cfg).unwrap();
        let plain = EmbeddingGenerator::from_config(&config(16)).unwrap();

        let a = adapted.embed("malware sample").await.unwrap();
        let b = plain.embed("malware sample").await.unwrap();
        assert_ne!(a, b);

        let expected = plain.embed("malware analysis: malware sample").await.unwrap();
        assert_eq!(a, expected);
    }

    #[test]
    fn test_unknown_backend() {
        let mut cfg = config(4);
        cfg.backend = "word2vec".to_string();
        assert!(matches!(
            create_embedder(&cfg),
            Err(Error::InvalidConfiguration(_))
        ));
    }
}
