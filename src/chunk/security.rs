//! Entity-aware chunking for security documents

use super::entities::{entity_splitting, EntityScanner, EntitySpan};
use super::{advance_chars, assemble, next_window_start, window_end, Chunker, ChunkerKind};
use crate::config::ChunkConfig;
use crate::error::Result;
use crate::models::{Chunk, Document};
use tracing::debug;

/// Plain windows adjusted so that no CVE id, address, URL or hash is split
pub struct EntityAwareChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    max_entity_slack: Option<usize>,
    scanner: EntityScanner,
}

impl EntityAwareChunker {
    pub fn new(config: &ChunkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            max_entity_slack: config.max_entity_slack,
            scanner: EntityScanner::new()?,
        })
    }

    /// Window spans over `text`, given its entity spans
    pub fn spans(&self, text: &str, entities: &[EntitySpan]) -> Vec<(usize, usize)> {
        let slack = self
            .max_entity_slack
            .unwrap_or_else(|| {
                entities
                    .iter()
                    .map(|e| text[e.start..e.end].chars().count())
                    .max()
                    .unwrap_or(0)
            });

        let mut spans = Vec::new();
        let mut start = 0;

        while start < text.len() {
            let mut end = window_end(text, start, self.chunk_size, self.chunk_overlap);

            if let Some(entity) = entity_splitting(entities, end) {
                let limit = advance_chars(text, start, self.chunk_size + slack);
                end = if entity.end <= limit {
                    entity.end
                } else if entity.start > start {
                    entity.start
                } else {
                    // Entity longer than any window we may build: keep it whole
                    entity.end
                };
                debug!(
                    entity = entity.kind.as_str(),
                    start = entity.start,
                    end = entity.end,
                    window_end = end,
                    "Moved window edge off an entity"
                );
            }

            spans.push((start, end));
            if end >= text.len() {
                break;
            }

            let mut next = next_window_start(text, start, end, self.chunk_overlap);
            if let Some(entity) = entity_splitting(entities, next) {
                next = entity.end;
            }
            start = next;
        }

        spans
    }
}

impl Chunker for EntityAwareChunker {
    fn split(&self, doc: &Document) -> Vec<Chunk> {
        let text = &doc.processed_content;
        let entities = self.scanner.scan(text);
        let mut chunks = assemble(doc, &self.spans(text, &entities), self.kind());

        for chunk in &mut chunks {
            let found =
                EntityScanner::entities_in(&entities, text, chunk.start_offset, chunk.end_offset);
            if !found.is_empty() {
                chunk.metadata.insert(
                    "entities".to_string(),
                    serde_json::to_value(found).unwrap_or_default(),
                );
            }
        }

        chunks
    }

    fn kind(&self) -> ChunkerKind {
        ChunkerKind::EntityAware
    }
}
