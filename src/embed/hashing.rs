//! Offline feature-hashing embedder
//!
//! Words and character trigrams are hashed with blake3 into signed buckets.
//! Texts sharing vocabulary land close together, which is enough for tests
//! and for small deployments without a model server.

use super::Embedder;
use crate::error::{Error, Result};
use async_trait::async_trait;

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

pub struct HashingEmbedder {
    model_name: String,
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(model_name: impl Into<String>, dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::InvalidConfiguration(
                "hashing embedder needs a dimension > 0".to_string(),
            ));
        }
        Ok(Self {
            model_name: model_name.into(),
            dimension,
        })
    }

    /// Raw (unnormalized) feature vector for one text
    pub fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lower = text.to_lowercase();

        for word in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            self.add_feature(&mut vector, b"w", word.as_bytes(), WORD_WEIGHT);

            let padded: Vec<char> = format!(" {} ", word).chars().collect();
            for window in padded.windows(3) {
                let trigram: String = window.iter().collect();
                self.add_feature(&mut vector, b"c", trigram.as_bytes(), TRIGRAM_WEIGHT);
            }
        }

        vector
    }

    fn add_feature(&self, vector: &mut [f32], namespace: &[u8], feature: &[u8], weight: f32) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(namespace);
        hasher.update(b":");
        hasher.update(feature);
        let digest = hasher.finalize();
        let bytes = digest.as_bytes();

        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&bytes[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };

        vector[bucket] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::normalize_embedding;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let a = normalize_embedding(a);
        let b = normalize_embedding(b);
        a.iter().zip(&b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_deterministic() {
        let embedder = HashingEmbedder::new("hashing-v1", 64).unwrap();
        assert_eq!(
            embedder.vectorize("Log4Shell remote code execution"),
            embedder.vectorize("Log4Shell remote code execution")
        );
    }

    #[test]
    fn test_shared_vocabulary_scores_higher() {
        let embedder = HashingEmbedder::new("hashing-v1", 256).unwrap();
        let query = embedder.vectorize("ransomware encrypts files");
        let close = embedder.vectorize("the ransomware strain encrypts victim files");
        let far = embedder.vectorize("quarterly budget meeting agenda");

        assert!(cosine(&query, &close) > cosine(&query, &far));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new("hashing-v1", 16).unwrap();
        assert!(embedder.vectorize("  ").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(HashingEmbedder::new("hashing-v1", 0).is_err());
    }
}
