//! osintkb - knowledge store and retrieval engine for cybersecurity documents
//!
//! This crate provides:
//! - A file-backed document store and vector index with atomic promotion
//! - Plain and entity-aware chunking that never splits CVE ids, hashes or IPs
//! - Pluggable embedding backends behind a retrying generator
//! - Exact similarity retrieval with optional BM25 blending
//! - CLI commands for ingestion, querying and store maintenance

pub mod chunk;
pub mod commands;
pub mod config;
pub mod docstore;
pub mod embed;
pub mod error;
pub mod index;
pub mod kb;
pub mod models;
pub mod persist;
pub mod progress;
pub mod rank;
pub mod retrieve;

pub use config::Config;
pub use error::{Error, Result};
pub use kb::KnowledgeBase;
