//! Init command implementation

use crate::config::Config;
use crate::error::{Error, Result};
use crate::kb::KnowledgeBase;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct InitInfo {
    pub config_path: PathBuf,
    pub storage_root: PathBuf,
    pub model: String,
    pub dimension: usize,
}

/// Write a default config and create the on-disk stores
pub async fn cmd_init(config_path: &Path, root: Option<PathBuf>, force: bool) -> Result<InitInfo> {
    if config_path.exists() && !force {
        return Err(Error::InvalidConfiguration(format!(
            "Config already exists at {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    let config = match root {
        Some(root) => Config::with_root(root),
        None => Config::default(),
    };
    config.validate()?;
    config.save(config_path)?;

    // Opening creates documents/ and vectors/
    let kb = KnowledgeBase::open(config.clone()).await?;
    info!(root = %config.storage.root.display(), "Initialized knowledge base");

    Ok(InitInfo {
        config_path: config_path.to_path_buf(),
        storage_root: config.storage.root.clone(),
        model: kb.generator().model_name().to_string(),
        dimension: kb.generator().dimension(),
    })
}

pub fn print_init(info: &InitInfo) {
    println!("✓ osintkb initialized");
    println!("  Config: {}", info.config_path.display());
    println!("  Storage: {}", info.storage_root.display());
    println!("  Embedding: {} ({} dims)", info.model, info.dimension);
    println!("\nNext steps:");
    println!("  1. Edit the config file to pick an embedding backend");
    println!("  2. Ingest documents: osintkb ingest /path/to/reports");
}
