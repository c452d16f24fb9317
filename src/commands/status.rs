//! Status and maintenance commands

use crate::error::Result;
use crate::kb::{KbIntegrity, KbStats, KnowledgeBase, RepairReport};
use crate::persist::IntegrityReport;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// Status information
#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub config_path: PathBuf,
    pub embedding_backend: String,
    pub generator_model: String,
    pub generator_dimension: usize,
    pub stats: KbStats,
}

/// Get knowledge base status
pub fn cmd_status(kb: &KnowledgeBase, config_path: PathBuf) -> StatusInfo {
    info!("Getting status");
    StatusInfo {
        config_path,
        embedding_backend: kb.config().embedding.backend.clone(),
        generator_model: kb.generator().model_name().to_string(),
        generator_dimension: kb.generator().dimension(),
        stats: kb.stats(),
    }
}

pub async fn cmd_verify(kb: &KnowledgeBase) -> Result<KbIntegrity> {
    info!("Verifying stores");
    kb.verify().await
}

/// Rebuild both indexes and drop vectors of missing documents
pub async fn cmd_rebuild(kb: &KnowledgeBase) -> Result<RepairReport> {
    info!("Rebuilding stores");
    kb.repair().await
}

#[derive(Debug, Clone, Serialize)]
pub struct GcStats {
    pub files_removed: usize,
}

/// Delete vector payloads no manifest entry references
pub async fn cmd_gc(kb: &KnowledgeBase) -> Result<GcStats> {
    let files_removed = kb.index().collect_garbage().await?;
    Ok(GcStats { files_removed })
}

/// Print status to console
pub fn print_status(status: &StatusInfo) {
    let stats = &status.stats;
    println!("\n📊 osintkb Status\n");
    println!("Configuration: {}", status.config_path.display());
    println!("Storage: {}", stats.storage_root.display());
    println!("\nEmbedding:");
    println!("  Backend: {}", status.embedding_backend);
    println!(
        "  Generator: {} ({} dims)",
        status.generator_model, status.generator_dimension
    );
    match stats.dimension {
        Some(dimension) => println!("  Index: {} ({} dims)", stats.model, dimension),
        None => println!("  Index: {} (empty)", stats.model),
    }
    println!("\nContents:");
    println!("  Documents: {}", stats.documents);
    println!("  Indexed documents: {}", stats.indexed_documents);
    if stats.partially_indexed_documents > 0 {
        println!(
            "  ⚠ Partially indexed: {}",
            stats.partially_indexed_documents
        );
    }
    println!("  Chunks: {}", stats.chunks);
    println!("  Avg chunks/document: {:.1}", stats.avg_chunks_per_document);
    if !stats.by_source_type.is_empty() {
        println!("\nBy source type:");
        for (source_type, count) in &stats.by_source_type {
            println!("  {}: {}", source_type, count);
        }
    }
}

fn print_store_integrity(name: &str, report: &IntegrityReport) {
    if report.is_clean() {
        println!("  {}: ✓ clean", name);
    } else {
        println!("  {}: ✗ {}", name, report.summary());
    }
}

pub fn print_integrity(integrity: &KbIntegrity) {
    println!("\n🔎 Integrity\n");
    print_store_integrity("Documents", &integrity.documents);
    print_store_integrity("Vectors", &integrity.vectors);
    if integrity.orphaned_vector_documents.is_empty() {
        println!("  Cross-store: ✓ clean");
    } else {
        println!(
            "  Cross-store: ✗ vectors for {} missing documents",
            integrity.orphaned_vector_documents.len()
        );
        for id in &integrity.orphaned_vector_documents {
            println!("    {}", id);
        }
    }
    if !integrity.is_clean() {
        println!("\nRun 'osintkb rebuild' to repair.");
    }
}

pub fn print_repair(report: &RepairReport) {
    println!("\n✓ Rebuild complete");
    println!("  Documents recovered: {}", report.documents.recovered);
    println!("  Vectors recovered: {}", report.vectors.recovered);
    let skipped = report.documents.skipped.len() + report.vectors.skipped.len();
    if skipped > 0 {
        println!("  Unreadable payloads skipped: {}", skipped);
        for path in report.documents.skipped.iter().chain(&report.vectors.skipped) {
            println!("    {}", path.display());
        }
    }
    println!(
        "  Orphaned vectors removed: {}",
        report.orphaned_vectors_removed
    );
    println!("  Files collected: {}", report.files_collected);
}
