//! Vector manifest: the authority on which records are retrievable

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Where a vector record's payload lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub document_id: Uuid,
    /// Payload path relative to the index root
    pub location: String,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub model: String,
    /// Declared embedding length; `None` until the first vector is accepted
    pub dimension: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: BTreeMap<Uuid, ManifestEntry>,
}

impl Manifest {
    pub fn new(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            model: model.into(),
            dimension: None,
            created_at: now,
            updated_at: now,
            entries: BTreeMap::new(),
        }
    }

    /// Chunk ids belonging to a document
    pub fn chunks_of(&self, document_id: &Uuid) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter(|(_, e)| e.document_id == *document_id)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of distinct documents with at least one entry
    pub fn document_count(&self) -> usize {
        let mut ids: Vec<Uuid> = self.entries.values().map(|e| e.document_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Whether any entry points at `location`
    pub fn references(&self, location: &str) -> bool {
        self.entries.values().any(|e| e.location == location)
    }
}
