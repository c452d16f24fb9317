//! Core records: documents, chunks and vector records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Free-form metadata attached to documents, chunks and vector records
pub type Metadata = Map<String, Value>;

/// Metadata key carrying the declared document type (e.g. `vulnerability`)
pub const SOURCE_TYPE_KEY: &str = "source_type";

/// Metadata key under which ingestion records indexing status
pub const INDEXING_KEY: &str = "indexing";

/// What a loader/processor hands to [`DocumentStore::put`](crate::docstore::DocumentStore::put)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentInput {
    /// Existing id to replace, or `None` to have one assigned
    #[serde(default)]
    pub id: Option<Uuid>,
    pub title: String,
    #[serde(default)]
    pub raw_content: String,
    pub processed_content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl DocumentInput {
    pub fn new(title: impl Into<String>, processed_content: impl Into<String>) -> Self {
        let processed_content = processed_content.into();
        Self {
            id: None,
            title: title.into(),
            raw_content: processed_content.clone(),
            processed_content,
            metadata: Metadata::new(),
        }
    }

    /// Set the declared source type (`vulnerability`, `research`, ...)
    pub fn with_source_type(mut self, source_type: impl Into<String>) -> Self {
        self.metadata
            .insert(SOURCE_TYPE_KEY.to_string(), Value::String(source_type.into()));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }
}

/// A stored document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    pub raw_content: String,
    pub processed_content: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn from_input(id: Uuid, input: DocumentInput) -> Self {
        Self {
            id,
            title: input.title,
            raw_content: input.raw_content,
            processed_content: input.processed_content,
            metadata: input.metadata,
            created_at: Utc::now(),
        }
    }

    /// Declared source type, if any
    pub fn source_type(&self) -> Option<&str> {
        self.metadata.get(SOURCE_TYPE_KEY).and_then(Value::as_str)
    }
}

/// A retrievable span of a document's processed content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub text: String,
    /// Byte offset into `processed_content` (inclusive)
    pub start_offset: usize,
    /// Byte offset into `processed_content` (exclusive)
    pub end_offset: usize,
    pub sequence_index: usize,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Chunk {
    pub fn new(
        document_id: Uuid,
        sequence_index: usize,
        start_offset: usize,
        end_offset: usize,
        text: String,
    ) -> Self {
        // Stable id: same document, position and span give the same chunk id
        let name = format!("{}:{}:{}", sequence_index, start_offset, end_offset);
        let chunk_id = Uuid::new_v5(&document_id, name.as_bytes());

        Self {
            chunk_id,
            document_id,
            text,
            start_offset,
            end_offset,
            sequence_index,
            metadata: Metadata::new(),
        }
    }

    /// Span length in bytes
    pub fn len(&self) -> usize {
        self.end_offset - self.start_offset
    }

    /// Span length in characters, the unit chunk windows are sized in
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A chunk together with its embedding, as persisted by the vector index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub embedding: Vec<f32>,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl VectorRecord {
    /// Build the record for an embedded chunk; span information moves into metadata
    pub fn from_chunk(chunk: Chunk, embedding: Vec<f32>) -> Self {
        let mut metadata = chunk.metadata;
        metadata.insert("sequence_index".to_string(), chunk.sequence_index.into());
        metadata.insert("start_offset".to_string(), chunk.start_offset.into());
        metadata.insert("end_offset".to_string(), chunk.end_offset.into());

        Self {
            chunk_id: chunk.chunk_id,
            document_id: chunk.document_id,
            embedding,
            text: chunk.text,
            metadata,
        }
    }

    pub fn sequence_index(&self) -> Option<usize> {
        self.metadata_usize("sequence_index")
    }

    pub fn start_offset(&self) -> Option<usize> {
        self.metadata_usize("start_offset")
    }

    pub fn end_offset(&self) -> Option<usize> {
        self.metadata_usize("end_offset")
    }

    fn metadata_usize(&self, key: &str) -> Option<usize> {
        self.metadata
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| v as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_is_stable() {
        let doc_id = Uuid::new_v4();
        let a = Chunk::new(doc_id, 0, 0, 10, "0123456789".to_string());
        let b = Chunk::new(doc_id, 0, 0, 10, "0123456789".to_string());
        let c = Chunk::new(doc_id, 1, 0, 10, "0123456789".to_string());

        assert_eq!(a.chunk_id, b.chunk_id);
        assert_ne!(a.chunk_id, c.chunk_id);
        assert_ne!(
            a.chunk_id,
            Chunk::new(Uuid::new_v4(), 0, 0, 10, String::new()).chunk_id
        );
    }

    #[test]
    fn test_record_carries_span() {
        let chunk = Chunk::new(Uuid::new_v4(), 3, 40, 90, "x".repeat(50));
        let record = VectorRecord::from_chunk(chunk.clone(), vec![1.0, 0.0]);

        assert_eq!(record.chunk_id, chunk.chunk_id);
        assert_eq!(record.sequence_index(), Some(3));
        assert_eq!(record.start_offset(), Some(40));
        assert_eq!(record.end_offset(), Some(90));
    }

    #[test]
    fn test_input_source_type() {
        let input = DocumentInput::new("CVE digest", "body").with_source_type("vulnerability");
        let doc = Document::from_input(Uuid::new_v4(), input);
        assert_eq!(doc.source_type(), Some("vulnerability"));
    }
}
