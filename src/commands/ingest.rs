//! Ingest and reindex commands

use crate::error::{Error, Result};
use crate::kb::{IndexingStatus, IngestReport, KnowledgeBase};
use crate::models::{Document, DocumentInput, INDEXING_KEY, SOURCE_TYPE_KEY};
use crate::progress::{advance_progress, finish_progress, start_progress};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Metadata key holding the blake3 hash of an ingested file's text
pub const CONTENT_HASH_KEY: &str = "content_hash";

/// Extensions picked up when walking a directory
pub const DEFAULT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "text", "log"];

/// Ingest options
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Title for a single ingested file (defaults to the file stem)
    pub title: Option<String>,
    /// Declared `source_type` for every ingested document
    pub source_type: Option<String>,
    /// Extensions to include when walking directories
    pub extensions: Option<Vec<String>>,
}

/// Totals for one ingest or reindex run
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub docs_processed: usize,
    pub docs_skipped: usize,
    /// Files whose stored document already matches
    pub docs_unchanged: usize,
    pub docs_partially_indexed: usize,
    pub chunks_indexed: usize,
    pub chunks_failed: usize,
    pub chunks_replaced: usize,
    pub reports: Vec<IngestReport>,
    pub errors: Vec<String>,
}

impl IngestStats {
    fn record(&mut self, label: &str, result: Result<IngestReport>) {
        match result {
            Ok(report) => {
                self.docs_processed += 1;
                self.chunks_indexed += report.chunks_indexed;
                self.chunks_failed += report.failed_chunks.len();
                self.chunks_replaced += report.replaced_chunks;
                if report.status == IndexingStatus::PartiallyIndexed {
                    self.docs_partially_indexed += 1;
                }
                self.reports.push(report);
            }
            Err(e) => {
                let error_msg = format!("{}: {}", label, e);
                warn!("{}", error_msg);
                self.errors.push(error_msg);
                self.docs_skipped += 1;
            }
        }
    }
}

/// Files or directories to ingest
pub async fn cmd_ingest_paths(
    kb: &KnowledgeBase,
    paths: &[PathBuf],
    options: IngestOptions,
) -> Result<IngestStats> {
    let files = collect_files(paths, options.extensions.as_deref())?;
    info!("Found {} files to ingest", files.len());

    // A title only makes sense for one document
    let single = files.len() == 1;
    let options = &options;
    let progress = start_progress(files.len(), "Ingesting files");

    let results: Vec<(PathBuf, Result<Option<IngestReport>>)> = stream::iter(files)
        .map(|path| {
            let progress = &progress;
            async move {
                let result = ingest_file(kb, &path, options, single).await;
                advance_progress(progress);
                (path, result)
            }
        })
        .buffered(kb.config().ingest.concurrency)
        .collect()
        .await;

    finish_progress(progress, "Files ingested");

    let mut stats = IngestStats::default();
    for (path, result) in results {
        match result {
            Ok(None) => stats.docs_unchanged += 1,
            Ok(Some(report)) => stats.record(&path.display().to_string(), Ok(report)),
            Err(e) => stats.record(&path.display().to_string(), Err(e)),
        }
    }

    info!(
        "Ingestion complete: {} docs, {} chunks indexed, {} unchanged, {} skipped",
        stats.docs_processed, stats.chunks_indexed, stats.docs_unchanged, stats.docs_skipped
    );
    Ok(stats)
}

/// Re-chunk and re-embed the given documents, or every document when empty
pub async fn cmd_reindex(kb: &KnowledgeBase, ids: Vec<Uuid>) -> Result<IngestStats> {
    let ids = if ids.is_empty() {
        kb.documents().list()
    } else {
        ids
    };
    info!("Reindexing {} documents", ids.len());

    let progress = start_progress(ids.len(), "Reindexing");
    let mut stats = IngestStats::default();
    for id in ids {
        let result = kb.reindex(&id).await;
        stats.record(&id.to_string(), result);
        advance_progress(&progress);
    }
    finish_progress(progress, "Documents reindexed");

    Ok(stats)
}

/// Expand directories into matching files; explicit files are always kept
pub fn collect_files(paths: &[PathBuf], extensions: Option<&[String]>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for path in paths {
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        if !path.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "{}: no such file or directory",
                path.display()
            )));
        }

        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if entry.file_type().is_file() && has_extension(entry.path(), extensions) {
                files.push(entry.into_path());
            }
        }
    }

    Ok(files)
}

fn has_extension(path: &Path, extensions: Option<&[String]>) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let ext = ext.to_ascii_lowercase();
    match extensions {
        Some(allowed) => allowed.iter().any(|a| a.trim_start_matches('.') == ext),
        None => DEFAULT_EXTENSIONS.contains(&ext.as_str()),
    }
}

/// Ingest one file; `None` when the stored copy is already up to date
async fn ingest_file(
    kb: &KnowledgeBase,
    path: &Path,
    options: &IngestOptions,
    single: bool,
) -> Result<Option<IngestReport>> {
    let input = load_input(path, options, single).await?;

    if let Some(id) = input.id {
        match kb.get_document(&id).await {
            Ok(existing) if is_unchanged(&existing, &input) => {
                debug!("File unchanged: {}", path.display());
                return Ok(None);
            }
            Ok(_) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }

    kb.ingest(input).await.map(Some)
}

fn is_unchanged(existing: &Document, input: &DocumentInput) -> bool {
    let indexed = existing
        .metadata
        .get(INDEXING_KEY)
        .and_then(|i| i.get("status"))
        .and_then(|s| s.as_str())
        == Some(IndexingStatus::Indexed.as_str());

    indexed
        && existing.title == input.title
        && existing.metadata.get(CONTENT_HASH_KEY) == input.metadata.get(CONTENT_HASH_KEY)
        && existing.metadata.get(SOURCE_TYPE_KEY) == input.metadata.get(SOURCE_TYPE_KEY)
}

/// Stable document id for a file, so re-ingesting it updates in place
pub fn file_document_id(path: &Path) -> Uuid {
    let uri = format!("file://{}", path.display());
    Uuid::new_v5(&Uuid::NAMESPACE_URL, uri.as_bytes())
}

async fn load_input(path: &Path, options: &IngestOptions, single: bool) -> Result<DocumentInput> {
    let path = &tokio::fs::canonicalize(path).await?;
    let bytes = tokio::fs::read(path).await?;
    let content = String::from_utf8(bytes).map_err(|_| {
        Error::InvalidDocument(format!("{} is not valid UTF-8 text", path.display()))
    })?;

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let title = match (&options.title, single) {
        (Some(title), true) => title.clone(),
        _ => stem,
    };

    let content_hash = blake3::hash(content.as_bytes()).to_hex().to_string();
    let mut input = DocumentInput::new(title, content)
        .with_id(file_document_id(path))
        .with_metadata("path", path.display().to_string())
        .with_metadata(CONTENT_HASH_KEY, content_hash);
    if let Some(source_type) = &options.source_type {
        input = input.with_source_type(source_type.clone());
    }
    Ok(input)
}

/// Print ingest or reindex totals to console
pub fn print_ingest_stats(stats: &IngestStats, heading: &str) {
    println!("\n✓ {}", heading);
    println!("  Documents processed: {}", stats.docs_processed);
    println!("  Chunks indexed: {}", stats.chunks_indexed);
    if stats.docs_unchanged > 0 {
        println!("  Unchanged: {}", stats.docs_unchanged);
    }
    if stats.chunks_replaced > 0 {
        println!("  Chunks replaced: {}", stats.chunks_replaced);
    }
    if stats.docs_partially_indexed > 0 {
        println!(
            "  ⚠ Partially indexed: {} documents ({} chunks failed)",
            stats.docs_partially_indexed, stats.chunks_failed
        );
    }
    if stats.docs_skipped > 0 {
        println!("  Skipped: {}", stats.docs_skipped);
        for error in &stats.errors {
            println!("    {}", error);
        }
    }
    for report in &stats.reports {
        println!(
            "  • {} [{}] {} chunks ({})",
            report.title, report.document_id, report.chunks_indexed, report.chunker
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    async fn open_kb(tmp: &TempDir) -> KnowledgeBase {
        let mut config = Config::with_root(tmp.path().join("kb"));
        config.embedding.dimension = 32;
        KnowledgeBase::open(config).await.unwrap()
    }

    #[test]
    fn test_collect_files_filters_extensions() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("reports");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("a.md"), "alpha").unwrap();
        std::fs::write(dir.join("nested/b.txt"), "beta").unwrap();
        std::fs::write(dir.join("c.png"), [0u8, 1, 2]).unwrap();

        let files = collect_files(&[dir.clone()], None).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.extension().unwrap() != "png"));

        let only_md = collect_files(&[dir], Some(&["md".to_string()])).unwrap();
        assert_eq!(only_md.len(), 1);
    }

    #[test]
    fn test_collect_files_missing_path() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            collect_files(&[tmp.path().join("absent")], None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_ingest_paths_reports_bad_files() {
        let tmp = TempDir::new().unwrap();
        let kb = open_kb(&tmp).await;
        let dir = tmp.path().join("intel");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("advisory.txt"),
            "CVE-2023-4966 affects NetScaler ADC. Patch now.",
        )
        .unwrap();
        std::fs::write(dir.join("empty.txt"), "   ").unwrap();
        std::fs::write(dir.join("binary.txt"), [0xffu8, 0xfe, 0x00]).unwrap();

        let options = IngestOptions {
            source_type: Some("vulnerability".to_string()),
            ..Default::default()
        };
        let stats = cmd_ingest_paths(&kb, &[dir], options).await.unwrap();

        assert_eq!(stats.docs_processed, 1);
        assert_eq!(stats.docs_skipped, 2);
        assert_eq!(stats.reports[0].title, "advisory");

        let doc = kb.get_document(&stats.reports[0].document_id).await.unwrap();
        assert_eq!(doc.source_type(), Some("vulnerability"));
        assert!(doc.metadata["path"].as_str().unwrap().ends_with("advisory.txt"));
    }

    #[tokio::test]
    async fn test_ingest_same_file_twice() {
        let tmp = TempDir::new().unwrap();
        let kb = open_kb(&tmp).await;
        let file = tmp.path().join("apt29.md");
        std::fs::write(&file, "APT29 used WINELOADER against European diplomats.").unwrap();

        let first = cmd_ingest_paths(&kb, &[file.clone()], IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(first.docs_processed, 1);
        let id = first.reports[0].document_id;
        assert_eq!(id, file_document_id(&file.canonicalize().unwrap()));

        let second = cmd_ingest_paths(&kb, &[file.clone()], IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(second.docs_processed, 0);
        assert_eq!(second.docs_unchanged, 1);
        assert_eq!(kb.documents().len(), 1);
        assert_eq!(kb.index().len(), first.chunks_indexed);

        // Another spelling of the same path
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        let detour = tmp.path().join("sub").join("..").join("apt29.md");
        let again = cmd_ingest_paths(&kb, &[detour], IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(again.docs_unchanged, 1);

        std::fs::write(&file, "APT29 moved to GRAPELOADER in 2025 campaigns.").unwrap();
        let changed = cmd_ingest_paths(&kb, &[file], IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(changed.docs_processed, 1);
        assert_eq!(changed.reports[0].document_id, id);
        assert_eq!(changed.chunks_replaced, first.chunks_indexed);
        assert_eq!(kb.documents().len(), 1);
        assert_eq!(kb.index().len(), changed.chunks_indexed);
        let doc = kb.get_document(&id).await.unwrap();
        assert!(doc.processed_content.contains("GRAPELOADER"));
    }

    #[tokio::test]
    async fn test_reindex_all_documents() {
        let tmp = TempDir::new().unwrap();
        let kb = open_kb(&tmp).await;
        let file = tmp.path().join("note.md");
        std::fs::write(&file, "Lateral movement via PsExec and WMI.").unwrap();

        let options = IngestOptions {
            title: Some("Lateral movement".to_string()),
            ..Default::default()
        };
        let ingested = cmd_ingest_paths(&kb, &[file], options).await.unwrap();
        assert_eq!(ingested.reports[0].title, "Lateral movement");

        let stats = cmd_reindex(&kb, Vec::new()).await.unwrap();
        assert_eq!(stats.docs_processed, 1);
        assert_eq!(stats.chunks_replaced, ingested.chunks_indexed);
        assert_eq!(kb.index().len(), ingested.chunks_indexed);
    }
}
