//! Configuration management for osintkb
//!
//! One explicit [`Config`] value is loaded (or defaulted) by the caller and
//! handed to every component constructor. Nothing below this module reads
//! the environment.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage layout configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Chunking configuration
    #[serde(default)]
    pub chunk: ChunkConfig,

    /// Embedding model configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Ingestion configuration
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// Where and how the stores persist their data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding `documents/` and `vectors/`
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,

    /// Rebuild a corrupt index/manifest on open instead of failing
    #[serde(default = "default_repair_on_open")]
    pub repair_on_open: bool,
}

/// Which chunker variant to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    /// Whitespace-aware windows
    Plain,
    /// Windows that never fragment structured security tokens
    EntityAware,
    /// Entity-aware for security source types, plain otherwise
    #[default]
    Auto,
}

/// Chunking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Maximum characters per chunk window
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Overlap characters between consecutive chunks
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Chunker selection
    #[serde(default)]
    pub strategy: ChunkStrategy,

    /// How far past `chunk_size` a window may grow to keep an entity whole.
    /// Unset means the length of the longest entity in the document.
    #[serde(default)]
    pub max_entity_slack: Option<usize>,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Backend: `hashing`, `http` or `fastembed`
    #[serde(default = "default_embedding_backend")]
    pub backend: String,

    /// Model name/identifier
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension (must match model)
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Base URL of the embedding service (http backend only)
    #[serde(default)]
    pub url: Option<String>,

    /// Batch size for embedding
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    /// Per-call timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first failed attempt
    #[serde(default = "default_embedding_max_retries")]
    pub max_retries: usize,

    /// Base backoff between retries in milliseconds (multiplied by attempt)
    #[serde(default = "default_embedding_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Prefix security context before embedding
    #[serde(default)]
    pub domain_adaptation: bool,
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Default number of results
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    /// Drop results scoring below this value
    #[serde(default)]
    pub score_threshold: Option<f32>,

    /// BM25 weight for hybrid scoring (0.0 - 1.0)
    #[serde(default = "default_hybrid_weight")]
    pub hybrid_weight: f32,

    /// Keep only the best chunk per document
    #[serde(default)]
    pub dedupe_by_document: bool,
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Documents chunked and embedded concurrently
    #[serde(default = "default_ingest_concurrency")]
    pub concurrency: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            repair_on_open: default_repair_on_open(),
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            strategy: ChunkStrategy::default(),
            max_entity_slack: None,
        }
    }
}

impl ChunkConfig {
    /// Check the window parameters
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfiguration(
                "chunk.chunk_size must be > 0".to_string(),
            ));
        }

        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::InvalidConfiguration(format!(
                "chunk.chunk_overlap ({}) must be < chunk.chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }

        Ok(())
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_embedding_backend(),
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            url: None,
            batch_size: default_embedding_batch_size(),
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_max_retries(),
            retry_backoff_ms: default_embedding_retry_backoff(),
            domain_adaptation: false,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            score_threshold: None,
            hybrid_weight: default_hybrid_weight(),
            dedupe_by_document: false,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: default_ingest_concurrency(),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        default_storage_root().join("config.toml")
    }

    /// Default configuration rooted at `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let mut config = Config::default();
        config.storage.root = root.into();
        config
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::InvalidConfiguration(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration if the file exists, otherwise use defaults
    pub fn load_or_default(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            debug!("No config file at {:?}, using defaults", config_path);
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        info!("Saved config to {:?}", config_path);
        Ok(())
    }

    /// Path of the document store
    pub fn documents_dir(&self) -> PathBuf {
        self.storage.root.join("documents")
    }

    /// Path of the vector index
    pub fn vectors_dir(&self) -> PathBuf {
        self.storage.root.join("vectors")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.chunk.validate()?;

        if self.embedding.dimension == 0 {
            return Err(Error::InvalidConfiguration(
                "embedding.dimension must be > 0".to_string(),
            ));
        }

        if self.embedding.batch_size == 0 {
            return Err(Error::InvalidConfiguration(
                "embedding.batch_size must be > 0".to_string(),
            ));
        }

        if self.embedding.timeout_secs == 0 {
            return Err(Error::InvalidConfiguration(
                "embedding.timeout_secs must be > 0".to_string(),
            ));
        }

        if self.embedding.backend == "http" && self.embedding.url.is_none() {
            return Err(Error::InvalidConfiguration(
                "embedding.url is required for the http backend".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.retrieval.hybrid_weight) {
            return Err(Error::InvalidConfiguration(
                "retrieval.hybrid_weight must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.retrieval.default_top_k == 0 {
            return Err(Error::InvalidConfiguration(
                "retrieval.default_top_k must be > 0".to_string(),
            ));
        }

        if self.ingest.concurrency == 0 {
            return Err(Error::InvalidConfiguration(
                "ingest.concurrency must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.chunk.chunk_size, 800);
        assert_eq!(config.chunk.chunk_overlap, 100);
        assert_eq!(config.chunk.strategy, ChunkStrategy::Auto);
        assert_eq!(config.embedding.dimension, 384);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        let mut config = Config::with_root(tmp.path());
        config.chunk.strategy = ChunkStrategy::EntityAware;
        config.embedding.dimension = 64;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.chunk.strategy, ChunkStrategy::EntityAware);
        assert_eq!(loaded.embedding.dimension, 64);
        assert_eq!(loaded.storage.root, tmp.path());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [chunk]
            chunk_size = 500
            strategy = "plain"
            "#,
        )
        .unwrap();

        assert_eq!(config.chunk.chunk_size, 500);
        assert_eq!(config.chunk.chunk_overlap, 100);
        assert_eq!(config.chunk.strategy, ChunkStrategy::Plain);
        assert_eq!(config.embedding.backend, "hashing");
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        // Invalid: overlap >= size
        config.chunk.chunk_overlap = config.chunk.chunk_size;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfiguration(_))
        ));

        config.chunk.chunk_overlap = 100;
        assert!(config.validate().is_ok());

        config.retrieval.hybrid_weight = 1.5;
        assert!(config.validate().is_err());
        config.retrieval.hybrid_weight = 0.3;

        config.embedding.backend = "http".to_string();
        assert!(config.validate().is_err());
        config.embedding.url = Some("http://127.0.0.1:8080".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let err = Config::load(&tmp.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }
}
