//! FastEmbed implementation for local embeddings

use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// FastEmbed-based embedder
pub struct FastEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
    model_name: String,
    dimension: usize,
}

/// Known model names and their output dimension
pub fn model_for_name(name: &str) -> Option<(EmbeddingModel, usize)> {
    match name {
        "BAAI/bge-small-en-v1.5" => Some((EmbeddingModel::BGESmallENV15, 384)),
        "BAAI/bge-base-en-v1.5" => Some((EmbeddingModel::BGEBaseENV15, 768)),
        "BAAI/bge-large-en-v1.5" => Some((EmbeddingModel::BGELargeENV15, 1024)),
        "sentence-transformers/all-MiniLM-L6-v2" | "all-MiniLM-L6-v2" => {
            Some((EmbeddingModel::AllMiniLML6V2, 384))
        }
        _ => None,
    }
}

impl FastEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        info!("Initializing FastEmbed with model: {}", config.model);

        let (model_enum, dimension) = model_for_name(&config.model).ok_or_else(|| {
            Error::InvalidConfiguration(format!("Unknown fastembed model '{}'", config.model))
        })?;

        if dimension != config.dimension {
            return Err(Error::DimensionMismatch {
                expected: config.dimension,
                actual: dimension,
            });
        }

        let options = InitOptions::new(model_enum).with_show_download_progress(true);
        let model = TextEmbedding::try_new(options).map_err(|e| {
            Error::EmbeddingFailure(format!("Failed to initialize model: {}", e))
        })?;

        info!("FastEmbed model loaded successfully");

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            model_name: config.model.clone(),
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Embedding {} texts", texts.len());

        // FastEmbed is synchronous
        let model = self.model.clone();
        let embeddings = tokio::task::spawn_blocking(move || {
            let model = model.blocking_lock();
            model.embed(texts, None)
        })
        .await
        .map_err(|e| Error::EmbeddingFailure(format!("Task join error: {}", e)))?
        .map_err(|e| Error::EmbeddingFailure(format!("Embedding failed: {}", e)))?;

        Ok(embeddings)
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

    #[test]
    fn test_model_dimensions() {
        assert_eq!(model_for_name("BAAI/bge-small-en-v1.5").map(|m| m.1), Some(384));
        assert_eq!(model_for_name("BAAI/bge-base-en-v1.5").map(|m| m.1), Some(768));
        assert!(model_for_name("unknown-model").is_none());
    }

    // Requires model download
    #[tokio::test]
    #[ignore]
    async fn test_fastembed_integration() {
        let config = EmbeddingConfig {
            backend: "fastembed".to_string(),
            model: "BAAI/bge-small-en-v1.5".to_string(),
            dimension: 384,
            ..EmbeddingConfig::default()
        };

        let embedder = FastEmbedder::new(&config).unwrap();
        let embeddings = embedder
            .embed(vec!["Hello world".to_string(), "Test embedding".to_string()])
            .await
            .unwrap();

        assert_eq!(embeddings.len(), 2);
        assert_eq!(embeddings[0].len(), 384);
    }
}
