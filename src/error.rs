//! Custom error types for osintkb

use thiserror::Error;

/// Main error type for knowledge base operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage corruption: {0}")]
    StorageCorruption(String),

    #[error("Embedding failure: {0}")]
    EmbeddingFailure(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Pattern error: {0}")]
    Regex(#[from] regex::Error),
}

impl Error {
    /// Shorthand for a missing document
    pub fn document_not_found(id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("document {}", id))
    }

    /// Shorthand for a missing vector record
    pub fn chunk_not_found(id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("chunk {}", id))
    }

    /// Whether a retry could plausibly succeed.
    ///
    /// Only embedding backend failures and transport errors qualify; dimension
    /// and argument errors are configuration defects.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::EmbeddingFailure(_) | Error::Http(_) | Error::Io(_))
    }
}

/// Result type alias for osintkb
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_mismatch_message() {
        let err = Error::DimensionMismatch {
            expected: 384,
            actual: 3,
        };
        assert_eq!(err.to_string(), "Dimension mismatch: expected 384, got 3");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::EmbeddingFailure("timeout".into()).is_transient());
        assert!(!Error::InvalidArgument("top_k".into()).is_transient());
        assert!(!Error::DimensionMismatch {
            expected: 1,
            actual: 2
        }
        .is_transient());
    }
}
