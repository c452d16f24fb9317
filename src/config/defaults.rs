//! Default values for configuration

use std::path::PathBuf;

/// Default storage root (~/.osintkb)
pub fn default_storage_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".osintkb")
}

/// Default: repair corrupt manifests when opening a store
pub fn default_repair_on_open() -> bool {
    true
}

/// Default maximum characters per chunk
pub fn default_chunk_size() -> usize {
    800
}

/// Default overlap characters between chunks
pub fn default_chunk_overlap() -> usize {
    100
}

/// Default embedding backend
pub fn default_embedding_backend() -> String {
    "hashing".to_string()
}

/// Default embedding model identifier
pub fn default_embedding_model() -> String {
    "hashing-v1".to_string()
}

/// Default embedding dimension
pub fn default_embedding_dimension() -> usize {
    384
}

/// Default batch size for embedding
pub fn default_embedding_batch_size() -> usize {
    32
}

/// Default embedding call timeout in seconds
pub fn default_embedding_timeout() -> u64 {
    30
}

/// Default number of retries after a failed embedding call
pub fn default_embedding_max_retries() -> usize {
    2
}

/// Default base backoff between embedding retries (milliseconds)
pub fn default_embedding_retry_backoff() -> u64 {
    200
}

/// Default number of results
pub fn default_top_k() -> usize {
    5
}

/// Default BM25 weight for hybrid scoring (0 = pure vector ranking)
pub fn default_hybrid_weight() -> f32 {
    0.0
}

/// Default number of documents ingested concurrently
pub fn default_ingest_concurrency() -> usize {
    4
}
