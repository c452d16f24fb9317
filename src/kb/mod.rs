//! Knowledge base facade
//!
//! Wires the document store, chunkers, embedding generator, vector index and
//! retriever together. Ingestion runs DocumentStore -> Chunker ->
//! EmbeddingGenerator -> VectorIndex; a failed chunk is recorded and skipped,
//! a failed document is returned to the caller.

use crate::chunk::{ChunkerKind, ChunkerSet};
use crate::config::Config;
use crate::docstore::DocumentStore;
use crate::embed::{Embedder, EmbeddingGenerator};
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::models::{Document, DocumentInput, Metadata, VectorRecord, INDEXING_KEY};
use crate::persist::{IntegrityReport, RebuildReport};
use crate::retrieve::{RetrievalHit, RetrieveOptions, Retriever, ScoredRecord};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

/// Indexing outcome recorded on the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingStatus {
    Indexed,
    PartiallyIndexed,
}

impl IndexingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexingStatus::Indexed => "indexed",
            IndexingStatus::PartiallyIndexed => "partially_indexed",
        }
    }
}

/// A chunk that could not be embedded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedChunk {
    pub sequence_index: usize,
    pub error: String,
}

/// Result of ingesting (or re-indexing) one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_id: Uuid,
    pub title: String,
    pub chunker: ChunkerKind,
    pub chunks_total: usize,
    pub chunks_indexed: usize,
    pub failed_chunks: Vec<FailedChunk>,
    /// Records the document had in the index before this run
    pub replaced_chunks: usize,
    pub status: IndexingStatus,
}

/// Knowledge base statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbStats {
    pub storage_root: PathBuf,
    pub documents: usize,
    pub indexed_documents: usize,
    pub partially_indexed_documents: usize,
    pub chunks: usize,
    pub avg_chunks_per_document: f64,
    pub dimension: Option<usize>,
    pub model: String,
    pub by_source_type: BTreeMap<String, usize>,
}

/// Integrity of both stores plus the links between them
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KbIntegrity {
    pub documents: IntegrityReport,
    pub vectors: IntegrityReport,
    /// Documents that have vector records but no stored document
    pub orphaned_vector_documents: Vec<Uuid>,
}

impl KbIntegrity {
    pub fn is_clean(&self) -> bool {
        self.documents.is_clean()
            && self.vectors.is_clean()
            && self.orphaned_vector_documents.is_empty()
    }
}

/// What [`KnowledgeBase::repair`] did
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepairReport {
    pub documents: RebuildReport,
    pub vectors: RebuildReport,
    pub orphaned_vectors_removed: usize,
    pub files_collected: usize,
}

/// Per-document locks.
///
/// Ingest, reindex and remove of one document run one at a time, so a
/// removal can never land between an indexing run's read of the document
/// and its promotion of vectors.
#[derive(Default)]
struct DocumentLocks {
    locks: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

struct DocumentGuard<'a> {
    owner: &'a DocumentLocks,
    id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl DocumentLocks {
    async fn lock(&self, id: Uuid) -> DocumentGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(id).or_default().clone()
        };
        DocumentGuard {
            owner: self,
            id,
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for DocumentGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.owner.locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(self.guard.take());
        // Only the map still holds it: nobody is waiting
        if locks.get(&self.id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.id);
        }
    }
}

pub struct KnowledgeBase {
    config: Config,
    documents: Arc<DocumentStore>,
    index: Arc<VectorIndex>,
    generator: Arc<EmbeddingGenerator>,
    chunkers: ChunkerSet,
    retriever: Retriever,
    locks: DocumentLocks,
}

impl KnowledgeBase {
    /// Open the stores under `config.storage.root` with the configured backend
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let generator = EmbeddingGenerator::from_config(&config.embedding)?;
        Self::assemble(config, generator).await
    }

    /// Open with a caller-supplied embedding backend
    pub async fn open_with_embedder(config: Config, backend: Arc<dyn Embedder>) -> Result<Self> {
        config.validate()?;
        let generator = EmbeddingGenerator::new(backend, &config.embedding)?;
        Self::assemble(config, generator).await
    }

    async fn assemble(config: Config, generator: EmbeddingGenerator) -> Result<Self> {
        let repair = config.storage.repair_on_open;
        let documents = Arc::new(DocumentStore::open(config.documents_dir(), repair).await?);
        let index = Arc::new(
            VectorIndex::open(config.vectors_dir(), generator.model_name(), repair).await?,
        );

        if let Some(declared) = index.dimension() {
            if declared != generator.dimension() {
                return Err(Error::DimensionMismatch {
                    expected: declared,
                    actual: generator.dimension(),
                });
            }
        }
        if index.model() != generator.model_name() {
            warn!(
                index_model = %index.model(),
                generator_model = %generator.model_name(),
                "Embedding model differs from the one that built the index"
            );
        }

        let chunkers = ChunkerSet::new(&config.chunk)?;
        let generator = Arc::new(generator);
        let retriever = Retriever::new(generator.clone(), index.clone());

        Ok(Self {
            config,
            documents,
            index,
            generator,
            chunkers,
            retriever,
            locks: DocumentLocks::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn generator(&self) -> &EmbeddingGenerator {
        &self.generator
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Store a document and index its chunks
    pub async fn ingest(&self, mut input: DocumentInput) -> Result<IngestReport> {
        let id = *input.id.get_or_insert_with(Uuid::new_v4);
        let _guard = self.locks.lock(id).await;
        self.documents.put(input).await?;
        self.index_document(&id).await
    }

    /// Ingest several documents, up to `ingest.concurrency` at a time.
    /// Results are in input order.
    pub async fn ingest_many(&self, inputs: Vec<DocumentInput>) -> Vec<Result<IngestReport>> {
        stream::iter(inputs)
            .map(|input| self.ingest(input))
            .buffered(self.config.ingest.concurrency)
            .collect()
            .await
    }

    /// Re-chunk and re-embed a stored document
    pub async fn reindex(&self, id: &Uuid) -> Result<IngestReport> {
        let _guard = self.locks.lock(*id).await;
        self.index_document(id).await
    }

    /// Callers hold the document's lock
    async fn index_document(&self, id: &Uuid) -> Result<IngestReport> {
        let document = self.documents.get(id).await?;
        let chunker = self.chunkers.select(document.source_type());
        let chunks = chunker.split(&document);
        let chunks_total = chunks.len();

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let batch = self.generator.embed_batch(&texts).await;

        let mut records = Vec::with_capacity(chunks_total);
        let mut failed_chunks = Vec::new();
        for (chunk, result) in chunks.into_iter().zip(batch.items) {
            match result {
                Ok(embedding) => records.push(VectorRecord::from_chunk(chunk, embedding)),
                Err(e) => {
                    warn!(
                        doc_id = %id,
                        sequence_index = chunk.sequence_index,
                        error = %e,
                        "Chunk not indexed"
                    );
                    failed_chunks.push(FailedChunk {
                        sequence_index: chunk.sequence_index,
                        error: e.to_string(),
                    });
                }
            }
        }

        let chunks_indexed = records.len();
        let replaced_chunks = self.index.replace_document(*id, records).await?;

        let status = if failed_chunks.is_empty() {
            IndexingStatus::Indexed
        } else {
            IndexingStatus::PartiallyIndexed
        };

        let mut patch = Metadata::new();
        patch.insert(
            INDEXING_KEY.to_string(),
            json!({
                "status": status.as_str(),
                "chunks_total": chunks_total,
                "chunks_indexed": chunks_indexed,
                "failed_chunks": failed_chunks.iter().map(|f| f.sequence_index).collect::<Vec<_>>(),
                "indexed_at": Utc::now().to_rfc3339(),
                "chunker": chunker.kind().as_str(),
            }),
        );
        self.documents.merge_metadata(id, patch).await?;

        if status == IndexingStatus::PartiallyIndexed {
            warn!(
                doc_id = %id,
                failed = failed_chunks.len(),
                total = chunks_total,
                "Document partially indexed"
            );
        }
        info!(
            doc_id = %id,
            title = %document.title,
            chunker = %chunker.kind(),
            chunks = chunks_indexed,
            "Indexed document"
        );

        Ok(IngestReport {
            document_id: *id,
            title: document.title,
            chunker: chunker.kind(),
            chunks_total,
            chunks_indexed,
            failed_chunks,
            replaced_chunks,
            status,
        })
    }

    /// Remove a document and every vector derived from it.
    ///
    /// Vectors go first so no record outlives its document. Stray vectors
    /// are purged even when the document itself is already gone, in which
    /// case `NotFound` is still returned.
    pub async fn remove(&self, id: &Uuid) -> Result<usize> {
        let _guard = self.locks.lock(*id).await;
        let removed = self.index.remove_by_document(id).await?;

        match self.documents.delete(id).await {
            Ok(()) => {
                info!(doc_id = %id, vectors = removed, "Removed document");
                Ok(removed)
            }
            Err(Error::NotFound(msg)) => {
                if removed > 0 {
                    warn!(doc_id = %id, vectors = removed, "Purged vectors of a missing document");
                }
                Err(Error::NotFound(msg))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_document(&self, id: &Uuid) -> Result<Document> {
        self.documents.get(id).await
    }

    /// A document's vector records ordered by sequence index
    pub fn document_chunks(&self, id: &Uuid) -> Result<Vec<Arc<VectorRecord>>> {
        if !self.documents.contains(id) {
            return Err(Error::document_not_found(id));
        }
        Ok(self.index.records_for_document(id))
    }

    pub async fn search(&self, query: &str, options: &RetrieveOptions) -> Result<Vec<RetrievalHit>> {
        self.retriever.search(query, options).await
    }

    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredRecord>> {
        self.retriever.retrieve(query, top_k, score_threshold).await
    }

    pub fn stats(&self) -> KbStats {
        let entries = self.documents.entries();
        let snapshot = self.index.snapshot();

        let mut by_source_type = BTreeMap::new();
        let mut partially_indexed_documents = 0;
        for (_, entry) in &entries {
            let source_type = entry
                .source_type
                .clone()
                .unwrap_or_else(|| "unspecified".to_string());
            *by_source_type.entry(source_type).or_insert(0) += 1;
            if entry.indexing_status.as_deref() == Some(IndexingStatus::PartiallyIndexed.as_str()) {
                partially_indexed_documents += 1;
            }
        }

        let documents = entries.len();
        let chunks = snapshot.len();
        KbStats {
            storage_root: self.config.storage.root.clone(),
            documents,
            indexed_documents: snapshot.document_ids().len(),
            partially_indexed_documents,
            chunks,
            avg_chunks_per_document: if documents > 0 {
                chunks as f64 / documents as f64
            } else {
                0.0
            },
            dimension: snapshot.dimension(),
            model: snapshot.model().to_string(),
            by_source_type,
        }
    }

    /// Check both stores and the links between them
    pub async fn verify(&self) -> Result<KbIntegrity> {
        Ok(KbIntegrity {
            documents: self.documents.verify().await?,
            vectors: self.index.verify().await?,
            orphaned_vector_documents: self.orphaned_vector_documents(),
        })
    }

    /// Rebuild both indexes from their payloads, drop vectors whose
    /// document is gone, and collect unreferenced files
    pub async fn repair(&self) -> Result<RepairReport> {
        let documents = self.documents.rebuild_index().await?;
        let vectors = self.index.rebuild_manifest().await?;

        let mut orphaned_vectors_removed = 0;
        for id in self.orphaned_vector_documents() {
            orphaned_vectors_removed += self.index.remove_by_document(&id).await?;
        }
        let files_collected = self.index.collect_garbage().await?;

        info!(
            documents = documents.recovered,
            vectors = vectors.recovered,
            orphaned_vectors_removed,
            files_collected,
            "Repaired knowledge base"
        );
        Ok(RepairReport {
            documents,
            vectors,
            orphaned_vectors_removed,
            files_collected,
        })
    }

    fn orphaned_vector_documents(&self) -> Vec<Uuid> {
        let known: HashSet<Uuid> = self.documents.list().into_iter().collect();
        self.index
            .snapshot()
            .document_ids()
            .into_iter()
            .filter(|id| !known.contains(id))
            .collect()
    }
}
