//! Document inspection and removal

use crate::docstore::DocumentEntry;
use crate::error::{Error, Result};
use crate::kb::KnowledgeBase;
use crate::models::{Document, VectorRecord};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// A stored document with its indexed chunks
#[derive(Debug, Clone, Serialize)]
pub struct DocumentDetail {
    pub document: Document,
    pub chunks: Vec<ChunkSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkSummary {
    pub chunk_id: Uuid,
    pub sequence_index: Option<usize>,
    pub start_offset: Option<usize>,
    pub end_offset: Option<usize>,
    pub chars: usize,
}

impl From<&Arc<VectorRecord>> for ChunkSummary {
    fn from(record: &Arc<VectorRecord>) -> Self {
        Self {
            chunk_id: record.chunk_id,
            sequence_index: record.sequence_index(),
            start_offset: record.start_offset(),
            end_offset: record.end_offset(),
            chars: record.text.chars().count(),
        }
    }
}

/// Index row shown by `list`
#[derive(Debug, Clone, Serialize)]
pub struct DocumentListing {
    pub id: Uuid,
    #[serde(flatten)]
    pub entry: DocumentEntry,
    pub chunks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveInfo {
    pub document_id: Uuid,
    pub vectors_removed: usize,
}

pub fn parse_document_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| Error::InvalidArgument(format!("'{}' is not a document id", raw)))
}

pub async fn cmd_get(kb: &KnowledgeBase, id: &Uuid) -> Result<DocumentDetail> {
    let document = kb.get_document(id).await?;
    let chunks = kb.document_chunks(id)?.iter().map(ChunkSummary::from).collect();
    Ok(DocumentDetail { document, chunks })
}

/// Documents, optionally restricted to one source type
pub fn cmd_list(kb: &KnowledgeBase, source_type: Option<&str>) -> Vec<DocumentListing> {
    let snapshot = kb.index().snapshot();
    kb.documents()
        .entries()
        .into_iter()
        .filter(|(_, entry)| source_type.is_none() || entry.source_type.as_deref() == source_type)
        .map(|(id, entry)| DocumentListing {
            id,
            chunks: snapshot.manifest().chunks_of(&id).len(),
            entry,
        })
        .collect()
}

pub async fn cmd_remove(kb: &KnowledgeBase, id: &Uuid) -> Result<RemoveInfo> {
    info!("Removing document {}", id);
    let vectors_removed = kb.remove(id).await?;
    Ok(RemoveInfo {
        document_id: *id,
        vectors_removed,
    })
}

pub fn print_document(detail: &DocumentDetail) {
    let doc = &detail.document;
    println!("\n📄 {}\n", doc.title);
    println!("ID: {}", doc.id);
    println!("Created: {}", doc.created_at.to_rfc3339());
    if let Some(source_type) = doc.source_type() {
        println!("Source type: {}", source_type);
    }
    if let Some(status) = doc.metadata.get("indexing").and_then(|i| i.get("status")) {
        println!("Indexing: {}", status.as_str().unwrap_or("unknown"));
    }
    println!("Content: {} chars", doc.processed_content.chars().count());
    println!("\nChunks ({}):", detail.chunks.len());
    for chunk in &detail.chunks {
        println!(
            "  #{} [{}..{}] {} chars  {}",
            chunk.sequence_index.map_or("?".to_string(), |s| s.to_string()),
            chunk.start_offset.map_or("?".to_string(), |s| s.to_string()),
            chunk.end_offset.map_or("?".to_string(), |s| s.to_string()),
            chunk.chars,
            chunk.chunk_id
        );
    }
}

pub fn print_documents(documents: &[DocumentListing]) {
    println!("\n📚 Stored Documents\n");

    if documents.is_empty() {
        println!("No documents stored. Use 'osintkb ingest' to add some.");
        return;
    }

    for doc in documents {
        println!(
            "• {} [{}]",
            doc.entry.title,
            doc.entry.source_type.as_deref().unwrap_or("unspecified")
        );
        println!("  ID: {}", doc.id);
        println!(
            "  Chunks: {}, Status: {}",
            doc.chunks,
            doc.entry.indexing_status.as_deref().unwrap_or("not indexed")
        );
        println!("  Created: {}", doc.entry.created_at.to_rfc3339());
        println!();
    }
}

/// Document ids for shell completion scripts
pub fn print_document_ids(documents: &[DocumentListing]) {
    for doc in documents {
        println!("{}", doc.id);
    }
}
