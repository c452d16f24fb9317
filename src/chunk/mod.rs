//! Text chunking
//!
//! This module handles splitting documents into chunks while:
//! - Keeping every chunk a verbatim slice of the processed content
//! - Breaking at whitespace when one is available inside the window
//! - Never fragmenting structured security tokens (entity-aware variant)
//! - Producing stable, deterministic chunk boundaries and ids

mod boundaries;
pub mod entities;
mod security;

pub use boundaries::*;
pub use security::EntityAwareChunker;

use crate::config::{ChunkConfig, ChunkStrategy};
use crate::error::Result;
use crate::models::{Chunk, Document, INDEXING_KEY};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Source types that get the entity-aware chunker under [`ChunkStrategy::Auto`]
pub const SECURITY_SOURCE_TYPES: &[&str] = &[
    "vulnerability",
    "threat",
    "malware",
    "attack",
    "exploit",
    "advisory",
    "cve",
];

/// Which chunker produced a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkerKind {
    Plain,
    EntityAware,
}

impl ChunkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkerKind::Plain => "plain",
            ChunkerKind::EntityAware => "entity_aware",
        }
    }
}

impl std::fmt::Display for ChunkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Splits a document's processed content into chunks
pub trait Chunker: Send + Sync {
    fn split(&self, doc: &Document) -> Vec<Chunk>;

    fn kind(&self) -> ChunkerKind;
}

/// Whitespace-aware fixed windows with overlap
#[derive(Debug, Clone)]
pub struct PlainChunker {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl PlainChunker {
    pub fn new(config: &ChunkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
        })
    }

    /// Window spans over `text`
    pub fn spans(&self, text: &str) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut start = 0;

        while start < text.len() {
            let end = window_end(text, start, self.chunk_size, self.chunk_overlap);
            spans.push((start, end));

            if end >= text.len() {
                break;
            }
            start = next_window_start(text, start, end, self.chunk_overlap);
        }

        spans
    }
}

impl Chunker for PlainChunker {
    fn split(&self, doc: &Document) -> Vec<Chunk> {
        assemble(doc, &self.spans(&doc.processed_content), self.kind())
    }

    fn kind(&self) -> ChunkerKind {
        ChunkerKind::Plain
    }
}

/// End of the window of `size` characters starting at `start`: the whole tail when it fits,
/// else the last whitespace inside the window, else a hard cut.
pub(crate) fn window_end(text: &str, start: usize, size: usize, overlap: usize) -> usize {
    let target = advance_chars(text, start, size);
    if target >= text.len() {
        return text.len();
    }

    let floor = advance_chars(text, start, overlap);
    let end = find_whitespace_break(text, floor, target).unwrap_or(target);

    if end > start {
        end
    } else {
        // Window narrower than one character
        ceil_char_boundary(text, start + 1)
    }
}

/// Turn window spans into chunks, dropping whitespace-only windows.
///
/// Sequence indices count kept chunks only. Each chunk inherits the
/// document's metadata (minus indexing status) plus its title and the
/// chunker that produced it.
pub(crate) fn assemble(doc: &Document, spans: &[(usize, usize)], kind: ChunkerKind) -> Vec<Chunk> {
    let text = &doc.processed_content;
    let mut chunks = Vec::with_capacity(spans.len());

    for &(start, end) in spans {
        let slice = &text[start..end];
        if slice.trim().is_empty() {
            continue;
        }

        let mut chunk = Chunk::new(doc.id, chunks.len(), start, end, slice.to_string());
        chunk.metadata = doc.metadata.clone();
        chunk.metadata.remove(INDEXING_KEY);
        chunk
            .metadata
            .insert("title".to_string(), Value::String(doc.title.clone()));
        chunk
            .metadata
            .insert("chunker".to_string(), Value::String(kind.as_str().to_string()));
        chunks.push(chunk);
    }

    chunks
}

/// Resolve a configured strategy for a document's source type
pub fn resolve_strategy(strategy: ChunkStrategy, source_type: Option<&str>) -> ChunkerKind {
    match strategy {
        ChunkStrategy::Plain => ChunkerKind::Plain,
        ChunkStrategy::EntityAware => ChunkerKind::EntityAware,
        ChunkStrategy::Auto => {
            let is_security = source_type.is_some_and(|t| {
                SECURITY_SOURCE_TYPES
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(t.trim()))
            });
            if is_security {
                ChunkerKind::EntityAware
            } else {
                ChunkerKind::Plain
            }
        }
    }
}

/// Build the chunker a document of `source_type` should use
pub fn build_chunker(config: &ChunkConfig, source_type: Option<&str>) -> Result<Box<dyn Chunker>> {
    Ok(match resolve_strategy(config.strategy, source_type) {
        ChunkerKind::Plain => Box::new(PlainChunker::new(config)?),
        ChunkerKind::EntityAware => Box::new(EntityAwareChunker::new(config)?),
    })
}

/// Both chunkers built once, selected per document
pub struct ChunkerSet {
    strategy: ChunkStrategy,
    plain: PlainChunker,
    entity_aware: EntityAwareChunker,
}

impl ChunkerSet {
    pub fn new(config: &ChunkConfig) -> Result<Self> {
        Ok(Self {
            strategy: config.strategy,
            plain: PlainChunker::new(config)?,
            entity_aware: EntityAwareChunker::new(config)?,
        })
    }

    pub fn select(&self, source_type: Option<&str>) -> &dyn Chunker {
        match resolve_strategy(self.strategy, source_type) {
            ChunkerKind::Plain => &self.plain,
            ChunkerKind::EntityAware => &self.entity_aware,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::DocumentInput;
    use uuid::Uuid;

    fn make_doc(text: &str) -> Document {
        Document::from_input(Uuid::new_v4(), DocumentInput::new("Test", text))
    }

    fn config(size: usize, overlap: usize) -> ChunkConfig {
        ChunkConfig {
            chunk_size: size,
            chunk_overlap: overlap,
            ..ChunkConfig::default()
        }
    }

    #[test]
    fn test_chunk_short_document() {
        let doc = make_doc("This is a short document.");
        let chunker = PlainChunker::new(&config(800, 100)).unwrap();

        let chunks = chunker.split(&doc);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "This is a short document.");
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].sequence_index, 0);
        assert_eq!(chunks[0].metadata["chunker"], "plain");
    }

    #[test]
    fn test_chunks_are_exact_slices_and_cover_text() {
        let text = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. ".repeat(60);
        let doc = make_doc(&text);
        let chunker = PlainChunker::new(&config(300, 40)).unwrap();

        let chunks = chunker.split(&doc);
        assert!(chunks.len() > 1);

        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks.last().unwrap().end_offset, text.len());
        for chunk in &chunks {
            assert_eq!(chunk.text, &text[chunk.start_offset..chunk.end_offset]);
            assert!(chunk.char_count() <= 300);
        }
        for pair in chunks.windows(2) {
            // Consecutive windows overlap or touch: no gaps
            assert!(pair[1].start_offset <= pair[0].end_offset);
            assert!(pair[1].start_offset > pair[0].start_offset);
            assert_eq!(pair[1].sequence_index, pair[0].sequence_index + 1);
        }
    }

    #[test]
    fn test_breaks_at_whitespace() {
        let text = "word ".repeat(100);
        let doc = make_doc(&text);
        let chunker = PlainChunker::new(&config(52, 10)).unwrap();

        for chunk in chunker.split(&doc).iter().filter(|c| c.end_offset < text.len()) {
            assert!(text[chunk.end_offset..].starts_with(' '));
        }
    }

    #[test]
    fn test_hard_cut_without_whitespace() {
        let text = "a".repeat(250);
        let doc = make_doc(&text);
        let chunker = PlainChunker::new(&config(100, 20)).unwrap();

        let spans: Vec<_> = chunker
            .split(&doc)
            .iter()
            .map(|c| (c.start_offset, c.end_offset))
            .collect();
        assert_eq!(spans, vec![(0, 100), (80, 180), (160, 250)]);
    }

    #[test]
    fn test_window_size_counts_characters() {
        // 490 characters, 910 bytes
        let text = "пароль ".repeat(70);
        let chunker = PlainChunker::new(&config(800, 100)).unwrap();
        assert_eq!(chunker.split(&make_doc(&text)).len(), 1);

        let text = "ж".repeat(250);
        let spans: Vec<_> = PlainChunker::new(&config(100, 20))
            .unwrap()
            .split(&make_doc(&text))
            .iter()
            .map(|c| (c.start_offset, c.end_offset, c.char_count()))
            .collect();
        assert_eq!(spans, vec![(0, 200, 100), (160, 360, 100), (320, 500, 90)]);
    }

    #[test]
    fn test_multibyte_text_stays_on_char_boundaries() {
        let text = "пароль утёк €€€ ".repeat(40);
        let doc = make_doc(&text);
        let chunker = PlainChunker::new(&config(37, 5)).unwrap();

        for chunk in chunker.split(&doc) {
            assert!(text.is_char_boundary(chunk.start_offset));
            assert!(text.is_char_boundary(chunk.end_offset));
        }
    }

    #[test]
    fn test_whitespace_only_windows_dropped() {
        let text = format!("alpha{}omega", " ".repeat(300));
        let doc = make_doc(&text);
        let chunker = PlainChunker::new(&config(100, 10)).unwrap();

        let chunks = chunker.split(&doc);
        assert!(chunks.iter().all(|c| !c.text.trim().is_empty()));
        assert!(chunks.iter().any(|c| c.text.contains("alpha")));
        assert!(chunks.iter().any(|c| c.text.contains("omega")));
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence_index, i);
        }
    }

    #[test]
    fn test_chunk_ids_are_deterministic() {
        let doc = make_doc(&"token ".repeat(400));
        let chunker = PlainChunker::new(&config(200, 20)).unwrap();

        let a: Vec<_> = chunker.split(&doc).into_iter().map(|c| c.chunk_id).collect();
        let b: Vec<_> = chunker.split(&doc).into_iter().map(|c| c.chunk_id).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_window_rejected() {
        assert!(matches!(
            PlainChunker::new(&config(100, 100)),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(
            PlainChunker::new(&config(0, 0)),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_resolve_strategy() {
        assert_eq!(
            resolve_strategy(ChunkStrategy::Auto, Some("Vulnerability")),
            ChunkerKind::EntityAware
        );
        assert_eq!(
            resolve_strategy(ChunkStrategy::Auto, Some("research")),
            ChunkerKind::Plain
        );
        assert_eq!(resolve_strategy(ChunkStrategy::Auto, None), ChunkerKind::Plain);
        assert_eq!(
            resolve_strategy(ChunkStrategy::Plain, Some("cve")),
            ChunkerKind::Plain
        );
    }

    #[test]
    fn test_build_chunker_by_source_type() {
        let cfg = ChunkConfig::default();
        assert_eq!(
            build_chunker(&cfg, Some("malware")).unwrap().kind(),
            ChunkerKind::EntityAware
        );
        assert_eq!(build_chunker(&cfg, None).unwrap().kind(), ChunkerKind::Plain);

        let set = ChunkerSet::new(&cfg).unwrap();
        assert_eq!(set.select(Some("threat")).kind(), ChunkerKind::EntityAware);
    }
}
