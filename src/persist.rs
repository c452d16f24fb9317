//! Staged writes for the file-backed stores
//!
//! Every payload and index file goes through the same sequence: write into a
//! staging directory, fsync, read back and compare the blake3 checksum, then
//! rename over the destination. A crash at any point leaves either the old
//! file or the new one in place, plus at most a stray staging file.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Extension given to in-flight staging files
pub const STAGING_EXT: &str = "tmp";

/// Consistency between an index file and the payloads on disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct IntegrityReport {
    /// Index entries whose payload file is gone
    pub missing_payloads: Vec<Uuid>,
    /// Payload files the index does not list
    pub orphan_payloads: Vec<Uuid>,
    /// Payloads whose bytes no longer match the recorded checksum
    pub checksum_mismatches: Vec<Uuid>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.missing_payloads.is_empty()
            && self.orphan_payloads.is_empty()
            && self.checksum_mismatches.is_empty()
    }

    /// Index entries pointing at nothing or at the wrong bytes
    pub fn is_corrupt(&self) -> bool {
        !self.missing_payloads.is_empty() || !self.checksum_mismatches.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} missing payloads, {} orphan payloads, {} checksum mismatches",
            self.missing_payloads.len(),
            self.orphan_payloads.len(),
            self.checksum_mismatches.len()
        )
    }
}

/// Outcome of rebuilding an index from the payloads on disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct RebuildReport {
    /// Payloads now listed in the index
    pub recovered: usize,
    /// Payloads left out (unreadable or inconsistent)
    pub skipped: Vec<PathBuf>,
}

/// Recover from a poisoned lock; the guarded data is an `Arc` swap target
/// and is never left half-written.
pub(crate) fn read_lock<T>(lock: &std::sync::RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write_lock<T>(lock: &std::sync::RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// blake3 hex digest of a payload
pub fn checksum(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Serialize `value` and promote it to `dest` through `staging_dir`.
///
/// Returns the checksum of the bytes now at `dest`.
pub async fn write_json_staged<T: Serialize>(
    staging_dir: &Path,
    dest: &Path,
    value: &T,
) -> Result<String> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_staged(staging_dir, dest, &bytes).await
}

/// Write `bytes` to `dest` atomically, verifying them before promotion.
pub async fn write_staged(staging_dir: &Path, dest: &Path, bytes: &[u8]) -> Result<String> {
    tokio::fs::create_dir_all(staging_dir).await?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let file_name = dest
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("payload");
    let tmp = staging_dir.join(format!(
        "{}.{}.{}",
        file_name,
        Uuid::new_v4().simple(),
        STAGING_EXT
    ));

    let expected = checksum(bytes);

    {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
    }

    let written = tokio::fs::read(&tmp).await?;
    let actual = checksum(&written);
    if actual != expected {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(Error::StorageCorruption(format!(
            "staged write of {} failed verification",
            dest.display()
        )));
    }

    tokio::fs::rename(&tmp, dest).await?;
    sync_dir(dest.parent()).await;

    debug!(path = %dest.display(), bytes = bytes.len(), "promoted staged write");
    Ok(expected)
}

/// Read and deserialize a JSON file
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Read a JSON file and return it with the checksum of its bytes
pub async fn read_json_with_checksum<T: DeserializeOwned>(path: &Path) -> Result<(T, String)> {
    let bytes = tokio::fs::read(path).await?;
    let value = serde_json::from_slice(&bytes)?;
    Ok((value, checksum(&bytes)))
}

/// Remove a file, treating "already gone" as success. Returns whether it existed.
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Delete leftover staging files. Returns how many were removed.
pub async fn clear_staging(staging_dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for path in list_files(staging_dir, STAGING_EXT).await? {
        if remove_if_exists(&path).await? {
            removed += 1;
        }
    }
    Ok(removed)
}

/// List files in `dir` with the given extension (missing dir = empty)
pub async fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(extension)
            && entry.file_type().await?.is_file()
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Payload file name for a record id
pub fn record_file_name(id: &Uuid) -> String {
    format!("{}.json", id)
}

/// Parse a record id back out of a payload path (`<id>.json` or `<id>.<tag>.json`)
pub fn record_id_from_path(path: &Path) -> Option<Uuid> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.split('.').next())
        .and_then(|s| Uuid::try_parse(s).ok())
}

#[cfg(unix)]
async fn sync_dir(dir: Option<&Path>) {
    // Best effort: persist the rename itself
    if let Some(dir) = dir {
        if let Ok(handle) = tokio::fs::File::open(dir).await {
            let _ = handle.sync_all().await;
        }
    }
}

#[cfg(not(unix))]
async fn sync_dir(_dir: Option<&Path>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        values: Vec<u32>,
    }

    #[tokio::test]
    async fn test_staged_write_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let staging = tmp.path().join("staging");
        let dest = tmp.path().join("records").join("a.json");

        let payload = Payload {
            name: "a".to_string(),
            values: vec![1, 2, 3],
        };
        let sum = write_json_staged(&staging, &dest, &payload).await.unwrap();

        let (loaded, loaded_sum): (Payload, String) =
            read_json_with_checksum(&dest).await.unwrap();
        assert_eq!(loaded, payload);
        assert_eq!(sum, loaded_sum);

        // Nothing left behind in staging
        assert!(list_files(&staging, STAGING_EXT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_content() {
        let tmp = TempDir::new().unwrap();
        let staging = tmp.path().join("staging");
        let dest = tmp.path().join("index.json");

        write_staged(&staging, &dest, b"{\"v\":1}").await.unwrap();
        write_staged(&staging, &dest, b"{\"v\":2}").await.unwrap();

        let content = tokio::fs::read_to_string(&dest).await.unwrap();
        assert_eq!(content, "{\"v\":2}");
    }

    #[tokio::test]
    async fn test_clear_staging_removes_leftovers() {
        let tmp = TempDir::new().unwrap();
        let staging = tmp.path().join("staging");
        tokio::fs::create_dir_all(&staging).await.unwrap();
        tokio::fs::write(staging.join("x.json.abc.tmp"), b"partial")
            .await
            .unwrap();
        tokio::fs::write(staging.join("keep.json"), b"{}").await.unwrap();

        assert_eq!(clear_staging(&staging).await.unwrap(), 1);
        assert!(staging.join("keep.json").exists());
    }

    #[tokio::test]
    async fn test_remove_if_exists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gone.json");
        assert!(!remove_if_exists(&path).await.unwrap());
        tokio::fs::write(&path, b"{}").await.unwrap();
        assert!(remove_if_exists(&path).await.unwrap());
    }

    #[test]
    fn test_record_id_from_path() {
        let id = Uuid::new_v4();
        let path = PathBuf::from("/x/records").join(record_file_name(&id));
        assert_eq!(record_id_from_path(&path), Some(id));
        let tagged = PathBuf::from("/x/records").join(format!("{}.0a1b2c.json", id));
        assert_eq!(record_id_from_path(&tagged), Some(id));
        assert_eq!(record_id_from_path(Path::new("/x/index.json")), None);
    }
}
