//! Document persistence
//!
//! Documents live as one JSON payload each under `records/`, listed by a
//! top-level `index.json`. The index is the ground truth for document
//! identity: a payload it does not list is invisible, and an entry it lists
//! always has a payload behind it because entries are only added after the
//! payload has been promoted, and only removed before the payload is
//! discarded.

use crate::error::{Error, Result};
use crate::models::{Document, DocumentInput, Metadata, INDEXING_KEY};
use crate::persist::{
    self, read_lock, write_lock, IntegrityReport, RebuildReport,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const INDEX_FILE: &str = "index.json";
const RECORDS_DIR: &str = "records";
const STAGING_DIR: &str = "staging";
const INDEX_SCHEMA_VERSION: u32 = 1;

/// One line of the document index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEntry {
    /// Payload path relative to the store root
    pub location: String,
    pub checksum: String,
    pub title: String,
    #[serde(default)]
    pub source_type: Option<String>,
    /// `metadata.indexing.status`, once ingestion has recorded it
    #[serde(default)]
    pub indexing_status: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The persisted id -> location index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentIndex {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub documents: BTreeMap<Uuid, DocumentEntry>,
}

impl DocumentIndex {
    fn empty() -> Self {
        let now = Utc::now();
        Self {
            schema_version: INDEX_SCHEMA_VERSION,
            created_at: now,
            updated_at: now,
            documents: BTreeMap::new(),
        }
    }
}

/// File-backed document store with a single writer and snapshot readers
pub struct DocumentStore {
    root: PathBuf,
    writer: Mutex<()>,
    index: RwLock<Arc<DocumentIndex>>,
}

impl DocumentStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// A corrupt index is rebuilt from the payloads when `repair` is set and
    /// reported as [`Error::StorageCorruption`] otherwise.
    pub async fn open(root: impl Into<PathBuf>, repair: bool) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(RECORDS_DIR)).await?;
        let stale = persist::clear_staging(&root.join(STAGING_DIR)).await?;
        if stale > 0 {
            debug!(count = stale, "Discarded interrupted document writes");
        }

        let index_path = root.join(INDEX_FILE);
        let (index, index_missing) = if index_path.exists() {
            (persist::read_json::<DocumentIndex>(&index_path).await?, false)
        } else {
            (DocumentIndex::empty(), true)
        };

        let store = Self {
            root,
            writer: Mutex::new(()),
            index: RwLock::new(Arc::new(index)),
        };

        let report = store.verify().await?;
        if index_missing && report.orphan_payloads.is_empty() {
            // Fresh store
            let _guard = store.writer.lock().await;
            let index = store.snapshot();
            store.promote_index((*index).clone()).await?;
        } else if index_missing || report.is_corrupt() {
            let problem = if index_missing {
                format!(
                    "document index missing with {} payloads on disk",
                    report.orphan_payloads.len()
                )
            } else {
                format!("document index inconsistent: {}", report.summary())
            };

            if !repair {
                return Err(Error::StorageCorruption(problem));
            }

            warn!("{}; rebuilding", problem);
            store.rebuild_index().await?;
        } else if !report.orphan_payloads.is_empty() {
            debug!(
                count = report.orphan_payloads.len(),
                "Unindexed document payloads left by interrupted writes"
            );
        }

        info!(
            documents = store.len(),
            root = %store.root.display(),
            "Document store opened"
        );
        Ok(store)
    }

    /// Store a document and return its id.
    ///
    /// Empty or whitespace-only processed content is rejected. An input that
    /// carries an existing id replaces that document.
    pub async fn put(&self, input: DocumentInput) -> Result<Uuid> {
        if input.processed_content.trim().is_empty() {
            warn!(title = %input.title, "Rejecting document with empty processed content");
            return Err(Error::InvalidDocument(format!(
                "document '{}' has empty processed content",
                input.title
            )));
        }

        let id = input.id.unwrap_or_else(Uuid::new_v4);
        let document = Document::from_input(id, input);

        let _guard = self.writer.lock().await;
        self.write_document(&document).await?;

        info!(doc_id = %id, title = %document.title, "Stored document");
        Ok(id)
    }

    /// Fetch a document by id
    pub async fn get(&self, id: &Uuid) -> Result<Document> {
        let entry = self
            .snapshot()
            .documents
            .get(id)
            .cloned()
            .ok_or_else(|| Error::document_not_found(id))?;

        let path = self.root.join(&entry.location);
        match persist::read_json::<Document>(&path).await {
            Ok(doc) => Ok(doc),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted after our snapshot was taken
                if self.contains(id) {
                    Err(Error::StorageCorruption(format!(
                        "document {} is indexed but {} is missing",
                        id,
                        path.display()
                    )))
                } else {
                    Err(Error::document_not_found(id))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// All document ids, in id order
    pub fn list(&self) -> Vec<Uuid> {
        self.snapshot().documents.keys().copied().collect()
    }

    /// Index entries, for listings that do not need document bodies
    pub fn entries(&self) -> Vec<(Uuid, DocumentEntry)> {
        self.snapshot()
            .documents
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.snapshot().documents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.snapshot().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a document. The index drops it before the payload is deleted.
    pub async fn delete(&self, id: &Uuid) -> Result<()> {
        let _guard = self.writer.lock().await;

        let mut index = (*self.snapshot()).clone();
        let entry = index
            .documents
            .remove(id)
            .ok_or_else(|| Error::document_not_found(id))?;
        self.promote_index(index).await?;

        persist::remove_if_exists(&self.root.join(&entry.location)).await?;
        info!(doc_id = %id, "Deleted document");
        Ok(())
    }

    /// Merge keys into a document's metadata (the only permitted mutation)
    pub async fn merge_metadata(&self, id: &Uuid, patch: Metadata) -> Result<Document> {
        let _guard = self.writer.lock().await;

        let mut document = self.get(id).await?;
        for (key, value) in patch {
            document.metadata.insert(key, value);
        }
        self.write_document(&document).await?;

        debug!(doc_id = %id, "Merged document metadata");
        Ok(document)
    }

    /// Compare the index with the payloads on disk
    pub async fn verify(&self) -> Result<IntegrityReport> {
        let index = self.snapshot();
        let mut report = IntegrityReport::default();

        for (id, entry) in &index.documents {
            let path = self.root.join(&entry.location);
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    if persist::checksum(&bytes) != entry.checksum {
                        report.checksum_mismatches.push(*id);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    report.missing_payloads.push(*id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        for path in persist::list_files(&self.records_dir(), "json").await? {
            if let Some(id) = persist::record_id_from_path(&path) {
                if !index.documents.contains_key(&id) {
                    report.orphan_payloads.push(id);
                }
            }
        }

        Ok(report)
    }

    /// Reconstruct the index from every readable payload
    pub async fn rebuild_index(&self) -> Result<RebuildReport> {
        let _guard = self.writer.lock().await;

        let mut index = DocumentIndex::empty();
        index.created_at = self.snapshot().created_at;
        let mut report = RebuildReport::default();

        for path in persist::list_files(&self.records_dir(), "json").await? {
            match persist::read_json_with_checksum::<Document>(&path).await {
                Ok((doc, checksum))
                    if persist::record_id_from_path(&path) == Some(doc.id) =>
                {
                    index.documents.insert(doc.id, self.entry_for(&doc, checksum));
                }
                Ok(_) => {
                    warn!(path = %path.display(), "Document payload id does not match file name");
                    report.skipped.push(path);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable document payload");
                    report.skipped.push(path);
                }
            }
        }

        report.recovered = index.documents.len();
        self.promote_index(index).await?;

        info!(
            recovered = report.recovered,
            skipped = report.skipped.len(),
            "Rebuilt document index"
        );
        Ok(report)
    }

    /// The last promoted index
    pub fn snapshot(&self) -> Arc<DocumentIndex> {
        read_lock(&self.index).clone()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn records_dir(&self) -> PathBuf {
        self.root.join(RECORDS_DIR)
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    fn entry_for(&self, doc: &Document, checksum: String) -> DocumentEntry {
        DocumentEntry {
            location: format!("{}/{}", RECORDS_DIR, persist::record_file_name(&doc.id)),
            checksum,
            title: doc.title.clone(),
            source_type: doc.source_type().map(str::to_string),
            indexing_status: doc
                .metadata
                .get(INDEXING_KEY)
                .and_then(|v| v.get("status"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            created_at: doc.created_at,
        }
    }

    /// Promote a payload, then the index entry that points at it.
    /// Callers hold the writer lock.
    async fn write_document(&self, document: &Document) -> Result<()> {
        let dest = self.records_dir().join(persist::record_file_name(&document.id));
        let checksum = persist::write_json_staged(&self.staging_dir(), &dest, document).await?;

        let mut index = (*self.snapshot()).clone();
        index
            .documents
            .insert(document.id, self.entry_for(document, checksum));
        self.promote_index(index).await
    }

    /// Persist `index` and make it the visible snapshot. Callers hold the writer lock.
    async fn promote_index(&self, mut index: DocumentIndex) -> Result<()> {
        index.updated_at = Utc::now();
        persist::write_json_staged(&self.staging_dir(), &self.root.join(INDEX_FILE), &index)
            .await?;
        *write_lock(&self.index) = Arc::new(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_store(tmp: &TempDir) -> DocumentStore {
        DocumentStore::open(tmp.path().join("documents"), true)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_get_list_delete() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        let id = store
            .put(DocumentInput::new("Advisory", "CVE-2024-1234 affects the parser."))
            .await
            .unwrap();

        let doc = store.get(&id).await.unwrap();
        assert_eq!(doc.title, "Advisory");
        assert_eq!(store.list(), vec![id]);

        store.delete(&id).await.unwrap();
        assert!(matches!(store.get(&id).await, Err(Error::NotFound(_))));
        assert!(matches!(store.delete(&id).await, Err(Error::NotFound(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_empty_content_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        let err = store
            .put(DocumentInput::new("Blank", "   \n\t "))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDocument(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_put_with_existing_id_replaces() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        let id = store.put(DocumentInput::new("v1", "first")).await.unwrap();
        store
            .put(DocumentInput::new("v2", "second").with_id(id))
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&id).await.unwrap().processed_content, "second");
    }

    #[tokio::test]
    async fn test_merge_metadata() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        let id = store
            .put(DocumentInput::new("Report", "body").with_source_type("threat"))
            .await
            .unwrap();

        let mut patch = Metadata::new();
        patch.insert("reviewed".to_string(), json!(true));
        let doc = store.merge_metadata(&id, patch).await.unwrap();

        assert_eq!(doc.metadata["reviewed"], json!(true));
        assert_eq!(doc.source_type(), Some("threat"));
        assert_eq!(doc.processed_content, "body");
        assert!(store.verify().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_reopen_preserves_documents() {
        let tmp = TempDir::new().unwrap();
        let id = {
            let store = open_store(&tmp).await;
            store.put(DocumentInput::new("Kept", "content")).await.unwrap()
        };

        let store = open_store(&tmp).await;
        assert_eq!(store.list(), vec![id]);
        assert_eq!(store.get(&id).await.unwrap().title, "Kept");
    }

    #[tokio::test]
    async fn test_missing_payload_detected_and_repaired() {
        let tmp = TempDir::new().unwrap();
        let (keep, lose) = {
            let store = open_store(&tmp).await;
            let keep = store.put(DocumentInput::new("keep", "a")).await.unwrap();
            let lose = store.put(DocumentInput::new("lose", "b")).await.unwrap();
            (keep, lose)
        };

        let payload = tmp
            .path()
            .join("documents/records")
            .join(persist::record_file_name(&lose));
        std::fs::remove_file(payload).unwrap();

        let err = DocumentStore::open(tmp.path().join("documents"), false)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::StorageCorruption(_)));

        let store = open_store(&tmp).await;
        assert_eq!(store.list(), vec![keep]);
    }

    #[tokio::test]
    async fn test_lost_index_rebuilt_from_payloads() {
        let tmp = TempDir::new().unwrap();
        let id = {
            let store = open_store(&tmp).await;
            store.put(DocumentInput::new("orphaned", "x")).await.unwrap()
        };

        std::fs::remove_file(tmp.path().join("documents/index.json")).unwrap();

        let store = open_store(&tmp).await;
        assert_eq!(store.list(), vec![id]);
    }
}
