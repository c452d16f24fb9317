//! Persistent vector index
//!
//! Each vector record is one JSON payload under `records/`, named after its
//! chunk id and content checksum so that a rewrite never clobbers a payload
//! the current manifest still points at. `manifest.json` lists the
//! retrievable records; it is promoted only after every payload an operation
//! wrote is durable, and readers work from the last promoted snapshot.
//!
//! Payloads written by one `replace_document` call carry the same
//! [`WriteBatch`], which lets a manifest rebuild restore a document's record
//! set as a unit.

mod manifest;

pub use manifest::*;

use crate::error::{Error, Result};
use crate::models::{Metadata, VectorRecord};
use crate::persist::{self, read_lock, write_lock, IntegrityReport, RebuildReport};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MANIFEST_FILE: &str = "manifest.json";
const RECORDS_DIR: &str = "records";
const STAGING_DIR: &str = "staging";

/// Tags every payload one `replace_document` call wrote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriteBatch {
    pub id: Uuid,
    /// How many payloads the batch holds
    pub size: usize,
}

/// On-disk form of a vector record
#[derive(Serialize, Deserialize)]
struct Payload<R> {
    #[serde(flatten)]
    record: R,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    batch: Option<WriteBatch>,
}

/// A payload found while rebuilding the manifest
struct Candidate {
    modified: Option<SystemTime>,
    batch: Option<WriteBatch>,
    entry: ManifestEntry,
    record: VectorRecord,
}

/// Immutable view of the index as of one manifest promotion
#[derive(Debug)]
pub struct IndexSnapshot {
    manifest: Manifest,
    records: BTreeMap<Uuid, Arc<VectorRecord>>,
}

impl IndexSnapshot {
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn dimension(&self) -> Option<usize> {
        self.manifest.dimension
    }

    pub fn model(&self) -> &str {
        &self.manifest.model
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, chunk_id: &Uuid) -> Option<&Arc<VectorRecord>> {
        self.records.get(chunk_id)
    }

    /// Records in chunk id order
    pub fn records(&self) -> impl Iterator<Item = &Arc<VectorRecord>> {
        self.records.values()
    }

    /// A document's records ordered by sequence index
    pub fn records_for_document(&self, document_id: &Uuid) -> Vec<Arc<VectorRecord>> {
        let mut records: Vec<Arc<VectorRecord>> = self
            .records
            .values()
            .filter(|r| r.document_id == *document_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.sequence_index().unwrap_or(usize::MAX), r.chunk_id));
        records
    }

    /// Distinct document ids with at least one record
    pub fn document_ids(&self) -> Vec<Uuid> {
        let ids: HashSet<Uuid> = self.records.values().map(|r| r.document_id).collect();
        let mut ids: Vec<Uuid> = ids.into_iter().collect();
        ids.sort();
        ids
    }
}

/// File-backed vector index with a single writer and snapshot readers
pub struct VectorIndex {
    root: PathBuf,
    writer: Mutex<()>,
    snapshot: RwLock<Arc<IndexSnapshot>>,
}

impl VectorIndex {
    /// Open (or create) an index rooted at `root` for embeddings from `model`.
    ///
    /// Missing or mismatching payloads are [`Error::StorageCorruption`]
    /// unless `repair` is set, in which case the manifest is rebuilt from
    /// the payloads on disk.
    pub async fn open(root: impl Into<PathBuf>, model: &str, repair: bool) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(RECORDS_DIR)).await?;
        let stale = persist::clear_staging(&root.join(STAGING_DIR)).await?;
        if stale > 0 {
            debug!(count = stale, "Discarded interrupted vector writes");
        }

        let manifest_path = root.join(MANIFEST_FILE);
        let (manifest, manifest_missing) = if manifest_path.exists() {
            (persist::read_json::<Manifest>(&manifest_path).await?, false)
        } else {
            (Manifest::new(model), true)
        };

        let (records, mut report) = load_records(&root, &manifest).await?;
        report.orphan_payloads = find_orphans(&root, &manifest).await?;

        let index = Self {
            root,
            writer: Mutex::new(()),
            snapshot: RwLock::new(Arc::new(IndexSnapshot { manifest, records })),
        };

        if manifest_missing && report.orphan_payloads.is_empty() {
            let _guard = index.writer.lock().await;
            let snapshot = index.snapshot();
            index
                .promote(snapshot.manifest.clone(), snapshot.records.clone())
                .await?;
        } else if manifest_missing || report.is_corrupt() {
            let problem = if manifest_missing {
                format!(
                    "vector manifest missing with {} payloads on disk",
                    report.orphan_payloads.len()
                )
            } else {
                format!("vector manifest inconsistent: {}", report.summary())
            };

            if !repair {
                return Err(Error::StorageCorruption(problem));
            }

            warn!("{}; rebuilding", problem);
            index.rebuild_manifest().await?;
        } else if !report.orphan_payloads.is_empty() {
            debug!(
                count = report.orphan_payloads.len(),
                "Unreferenced vector payloads awaiting garbage collection"
            );
        }

        // An index that never held a vector takes the caller's model
        let snapshot = index.snapshot();
        if snapshot.manifest.dimension.is_none() && snapshot.manifest.model != model {
            let _guard = index.writer.lock().await;
            let mut manifest = snapshot.manifest.clone();
            manifest.model = model.to_string();
            index.promote(manifest, snapshot.records.clone()).await?;
        }

        info!(
            records = index.len(),
            dimension = ?index.dimension(),
            model = %index.model(),
            "Vector index opened"
        );
        Ok(index)
    }

    /// Add (or overwrite) one record
    pub async fn add(
        &self,
        chunk_id: Uuid,
        document_id: Uuid,
        text: impl Into<String>,
        embedding: Vec<f32>,
        metadata: Metadata,
    ) -> Result<()> {
        self.add_record(VectorRecord {
            chunk_id,
            document_id,
            embedding,
            text: text.into(),
            metadata,
        })
        .await
    }

    pub async fn add_record(&self, record: VectorRecord) -> Result<()> {
        let _guard = self.writer.lock().await;
        let snapshot = self.snapshot();
        let dimension = check_dimension(snapshot.dimension(), &record.embedding)?;

        let entry = self.write_payload(&record, None).await?;
        let mut manifest = snapshot.manifest.clone();
        let mut records = snapshot.records.clone();
        manifest.dimension = Some(dimension);
        let previous = manifest.entries.insert(record.chunk_id, entry);
        records.insert(record.chunk_id, Arc::new(record));

        self.promote(manifest, records).await?;
        self.discard_unreferenced(previous.into_iter().map(|e| e.location))
            .await?;
        Ok(())
    }

    /// Swap a document's records for `records` in one manifest promotion.
    ///
    /// Returns how many records the document had before.
    pub async fn replace_document(
        &self,
        document_id: Uuid,
        records: Vec<VectorRecord>,
    ) -> Result<usize> {
        if let Some(stray) = records.iter().find(|r| r.document_id != document_id) {
            return Err(Error::InvalidArgument(format!(
                "record {} belongs to document {}, not {}",
                stray.chunk_id, stray.document_id, document_id
            )));
        }

        let _guard = self.writer.lock().await;
        let snapshot = self.snapshot();

        let mut dimension = snapshot.dimension();
        for record in &records {
            dimension = Some(check_dimension(dimension, &record.embedding)?);
        }

        let batch = WriteBatch {
            id: Uuid::new_v4(),
            size: records.len(),
        };
        let mut entries = Vec::with_capacity(records.len());
        for record in &records {
            entries.push(self.write_payload(record, Some(batch)).await?);
        }

        let mut manifest = snapshot.manifest.clone();
        let mut map = snapshot.records.clone();

        let old_ids = manifest.chunks_of(&document_id);
        let mut stale = Vec::with_capacity(old_ids.len());
        for id in &old_ids {
            if let Some(entry) = manifest.entries.remove(id) {
                stale.push(entry.location);
            }
            map.remove(id);
        }

        manifest.dimension = dimension;
        let added = records.len();
        for (record, entry) in records.into_iter().zip(entries) {
            manifest.entries.insert(record.chunk_id, entry);
            map.insert(record.chunk_id, Arc::new(record));
        }

        self.promote(manifest, map).await?;
        self.discard_unreferenced(stale).await?;

        debug!(
            doc_id = %document_id,
            replaced = old_ids.len(),
            added,
            "Replaced document vectors"
        );
        Ok(old_ids.len())
    }

    /// Remove one record
    pub async fn remove(&self, chunk_id: &Uuid) -> Result<()> {
        let _guard = self.writer.lock().await;
        let snapshot = self.snapshot();

        let mut manifest = snapshot.manifest.clone();
        let entry = manifest
            .entries
            .remove(chunk_id)
            .ok_or_else(|| Error::chunk_not_found(chunk_id))?;
        let mut records = snapshot.records.clone();
        records.remove(chunk_id);

        self.promote(manifest, records).await?;
        self.discard_unreferenced([entry.location]).await?;
        Ok(())
    }

    /// Remove every record of a document, returning how many went
    pub async fn remove_by_document(&self, document_id: &Uuid) -> Result<usize> {
        let _guard = self.writer.lock().await;
        let snapshot = self.snapshot();

        let ids = snapshot.manifest.chunks_of(document_id);
        if ids.is_empty() {
            return Ok(0);
        }

        let mut manifest = snapshot.manifest.clone();
        let mut records = snapshot.records.clone();
        let mut locations = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(entry) = manifest.entries.remove(id) {
                locations.push(entry.location);
            }
            records.remove(id);
        }

        self.promote(manifest, records).await?;
        self.discard_unreferenced(locations).await?;

        info!(doc_id = %document_id, removed = ids.len(), "Removed document vectors");
        Ok(ids.len())
    }

    pub fn get(&self, chunk_id: &Uuid) -> Result<VectorRecord> {
        self.snapshot()
            .get(chunk_id)
            .map(|r| (**r).clone())
            .ok_or_else(|| Error::chunk_not_found(chunk_id))
    }

    pub fn all(&self) -> Vec<Arc<VectorRecord>> {
        self.snapshot().records().cloned().collect()
    }

    pub fn records_for_document(&self, document_id: &Uuid) -> Vec<Arc<VectorRecord>> {
        self.snapshot().records_for_document(document_id)
    }

    /// Declared embedding length, once known
    pub fn dimension(&self) -> Option<usize> {
        self.snapshot().dimension()
    }

    pub fn model(&self) -> String {
        self.snapshot().model().to_string()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The last promoted snapshot
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        read_lock(&self.snapshot).clone()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compare the manifest with the payloads on disk
    pub async fn verify(&self) -> Result<IntegrityReport> {
        let snapshot = self.snapshot();
        let (_, mut report) = load_records(&self.root, &snapshot.manifest).await?;
        report.orphan_payloads = find_orphans(&self.root, &snapshot.manifest).await?;
        Ok(report)
    }

    /// Rebuild the manifest from every readable payload.
    ///
    /// Payloads whose embedding length disagrees with the declared (or first
    /// seen) dimension are skipped. Each document gets back the records of
    /// one write batch: the newest complete batch, else the newest one.
    /// Unbatched payloads fill in chunks that batch lacks, and when several
    /// payloads remain for one chunk the most recently written wins.
    pub async fn rebuild_manifest(&self) -> Result<RebuildReport> {
        let _guard = self.writer.lock().await;
        let snapshot = self.snapshot();

        let mut report = RebuildReport::default();
        let mut dimension = snapshot.dimension();
        let mut by_document: HashMap<Uuid, Vec<Candidate>> = HashMap::new();

        for path in persist::list_files(&self.records_dir(), "json").await? {
            let payload = match persist::read_json_with_checksum::<Payload<VectorRecord>>(&path)
                .await
            {
                Ok((payload, checksum))
                    if persist::record_id_from_path(&path) == Some(payload.record.chunk_id) =>
                {
                    (payload, checksum)
                }
                Ok(_) => {
                    warn!(path = %path.display(), "Vector payload id does not match file name");
                    report.skipped.push(path);
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable vector payload");
                    report.skipped.push(path);
                    continue;
                }
            };
            let (Payload { record, batch }, checksum) = payload;

            match check_dimension(dimension, &record.embedding) {
                Ok(d) => dimension = Some(d),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping vector payload");
                    report.skipped.push(path);
                    continue;
                }
            }

            let modified = tokio::fs::metadata(&path)
                .await
                .ok()
                .and_then(|m| m.modified().ok());
            let entry = ManifestEntry {
                document_id: record.document_id,
                location: relative_location(&path),
                checksum,
            };

            by_document
                .entry(record.document_id)
                .or_default()
                .push(Candidate {
                    modified,
                    batch,
                    entry,
                    record,
                });
        }

        let mut manifest = snapshot.manifest.clone();
        manifest.entries.clear();
        manifest.dimension = dimension;
        let mut records = BTreeMap::new();
        for (document_id, candidates) in by_document {
            let discarded = candidates.len();
            let kept = select_record_set(candidates);
            if kept.len() < discarded {
                debug!(
                    doc_id = %document_id,
                    kept = kept.len(),
                    discarded = discarded - kept.len(),
                    "Dropped superseded vector payloads"
                );
            }
            for candidate in kept {
                manifest.entries.insert(candidate.record.chunk_id, candidate.entry);
                records.insert(candidate.record.chunk_id, Arc::new(candidate.record));
            }
        }

        report.recovered = records.len();
        self.promote(manifest, records).await?;

        info!(
            recovered = report.recovered,
            skipped = report.skipped.len(),
            "Rebuilt vector manifest"
        );
        Ok(report)
    }

    /// Delete payloads the manifest does not reference and leftover staging
    /// files. Returns how many files were removed.
    pub async fn collect_garbage(&self) -> Result<usize> {
        let _guard = self.writer.lock().await;
        let snapshot = self.snapshot();

        let mut removed = persist::clear_staging(&self.staging_dir()).await?;
        let referenced: HashSet<&str> = snapshot
            .manifest
            .entries
            .values()
            .map(|e| e.location.as_str())
            .collect();

        for path in persist::list_files(&self.records_dir(), "json").await? {
            if !referenced.contains(relative_location(&path).as_str())
                && persist::remove_if_exists(&path).await?
            {
                removed += 1;
            }
        }

        info!(removed, "Collected vector garbage");
        Ok(removed)
    }

    fn records_dir(&self) -> PathBuf {
        self.root.join(RECORDS_DIR)
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Stage and promote one payload under a content-addressed name
    async fn write_payload(
        &self,
        record: &VectorRecord,
        batch: Option<WriteBatch>,
    ) -> Result<ManifestEntry> {
        let bytes = serde_json::to_vec_pretty(&Payload { record, batch })?;
        let digest = persist::checksum(&bytes);
        let file_name = format!("{}.{}.json", record.chunk_id, &digest[..16]);
        let dest = self.records_dir().join(&file_name);

        let checksum = persist::write_staged(&self.staging_dir(), &dest, &bytes).await?;
        Ok(ManifestEntry {
            document_id: record.document_id,
            location: format!("{}/{}", RECORDS_DIR, file_name),
            checksum,
        })
    }

    /// Delete payload files, skipping any the current manifest still uses.
    /// Callers hold the writer lock and have already promoted.
    async fn discard_unreferenced(&self, locations: impl IntoIterator<Item = String>) -> Result<()> {
        let snapshot = self.snapshot();
        for location in locations {
            if !snapshot.manifest.references(&location) {
                persist::remove_if_exists(&self.root.join(&location)).await?;
            }
        }
        Ok(())
    }

    /// Persist a manifest and publish the matching snapshot. Callers hold the writer lock.
    async fn promote(
        &self,
        mut manifest: Manifest,
        records: BTreeMap<Uuid, Arc<VectorRecord>>,
    ) -> Result<()> {
        manifest.updated_at = Utc::now();
        persist::write_json_staged(&self.staging_dir(), &self.root.join(MANIFEST_FILE), &manifest)
            .await?;
        *write_lock(&self.snapshot) = Arc::new(IndexSnapshot { manifest, records });
        Ok(())
    }
}

/// Pick one document's records out of every payload found for it
fn select_record_set(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut batches: HashMap<WriteBatch, (usize, Option<SystemTime>)> = HashMap::new();
    for candidate in &candidates {
        if let Some(batch) = candidate.batch {
            let (found, newest) = batches.entry(batch).or_insert((0, None));
            *found += 1;
            *newest = (*newest).max(candidate.modified);
        }
    }

    let chosen = batches
        .into_iter()
        .max_by_key(|(batch, (found, newest))| (*found >= batch.size, *newest, batch.id))
        .map(|(batch, _)| batch);

    let mut by_chunk: HashMap<Uuid, Candidate> = HashMap::new();
    for candidate in candidates {
        if candidate.batch.is_some() && candidate.batch != chosen {
            continue;
        }
        let newer = by_chunk
            .get(&candidate.record.chunk_id)
            .map_or(true, |seen| {
                // The chosen batch beats unbatched payloads of the same chunk
                (candidate.batch.is_some(), candidate.modified)
                    >= (seen.batch.is_some(), seen.modified)
            });
        if newer {
            by_chunk.insert(candidate.record.chunk_id, candidate);
        }
    }
    by_chunk.into_values().collect()
}

/// Validate an embedding against the declared length (or adopt its length)
fn check_dimension(declared: Option<usize>, embedding: &[f32]) -> Result<usize> {
    if embedding.is_empty() {
        return Err(Error::InvalidArgument("embedding is empty".to_string()));
    }
    match declared {
        Some(expected) if expected != embedding.len() => Err(Error::DimensionMismatch {
            expected,
            actual: embedding.len(),
        }),
        _ => Ok(embedding.len()),
    }
}

fn relative_location(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}/{}", RECORDS_DIR, file_name)
}

/// Load every manifest entry's payload, noting missing and mismatching ones
async fn load_records(
    root: &Path,
    manifest: &Manifest,
) -> Result<(BTreeMap<Uuid, Arc<VectorRecord>>, IntegrityReport)> {
    let mut records = BTreeMap::new();
    let mut report = IntegrityReport::default();

    for (id, entry) in &manifest.entries {
        let bytes = match tokio::fs::read(root.join(&entry.location)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                report.missing_payloads.push(*id);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if persist::checksum(&bytes) != entry.checksum {
            report.checksum_mismatches.push(*id);
            continue;
        }

        match serde_json::from_slice::<VectorRecord>(&bytes) {
            Ok(record)
                if record.chunk_id == *id
                    && manifest
                        .dimension
                        .map_or(true, |d| d == record.embedding.len()) =>
            {
                records.insert(*id, Arc::new(record));
            }
            _ => report.checksum_mismatches.push(*id),
        }
    }

    Ok((records, report))
}

/// Payload files no manifest entry points at
async fn find_orphans(root: &Path, manifest: &Manifest) -> Result<Vec<Uuid>> {
    let referenced: HashSet<&str> = manifest
        .entries
        .values()
        .map(|e| e.location.as_str())
        .collect();

    let mut orphans = Vec::new();
    for path in persist::list_files(&root.join(RECORDS_DIR), "json").await? {
        if !referenced.contains(relative_location(&path).as_str()) {
            if let Some(id) = persist::record_id_from_path(&path) {
                orphans.push(id);
            }
        }
    }
    Ok(orphans)
}
