//! Query command implementation

use crate::error::{Error, Result};
use crate::kb::KnowledgeBase;
use crate::retrieve::{RetrievalHit, RetrieveOptions};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

/// Query options; unset fields fall back to the retrieval config
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub k: Option<usize>,
    pub min_score: Option<f32>,
    /// `key=value` metadata filters
    pub filters: Vec<String>,
    pub dedupe_docs: bool,
    pub hybrid_weight: Option<f32>,
}

/// Query result for CLI display
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub query: String,
    pub results: Vec<RetrievalHit>,
    pub chunks_searched: usize,
}

/// Execute a query
pub async fn cmd_query(kb: &KnowledgeBase, query: &str, options: QueryOptions) -> Result<QueryResult> {
    info!("Querying: {}", query);

    let config = &kb.config().retrieval;
    let mut retrieve = RetrieveOptions::from_config(config)
        .with_dedupe(options.dedupe_docs || config.dedupe_by_document);
    if let Some(k) = options.k {
        retrieve.top_k = k;
    }
    if options.min_score.is_some() {
        retrieve.score_threshold = options.min_score;
    }
    if let Some(weight) = options.hybrid_weight {
        retrieve.hybrid_weight = weight;
    }
    for filter in &options.filters {
        let (key, value) = parse_filter(filter)?;
        retrieve = retrieve.with_filter(key, value);
    }

    let chunks_searched = kb.index().len();
    let results = kb.search(query, &retrieve).await?;
    info!("Returning {} results", results.len());

    Ok(QueryResult {
        query: query.to_string(),
        results,
        chunks_searched,
    })
}

/// Split `key=value`; the value is read as JSON when it parses, as a string otherwise
pub fn parse_filter(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| Error::InvalidArgument(format!("filter '{}' is not key=value", raw)))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::InvalidArgument(format!("filter '{}' has no key", raw)));
    }

    let value = value.trim();
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Print query results to console
pub fn print_query_results(result: &QueryResult) {
    println!("\n🔍 Query: {}\n", result.query);
    println!(
        "Found {} results ({} chunks searched):\n",
        result.results.len(),
        result.chunks_searched
    );

    for (i, hit) in result.results.iter().enumerate() {
        let title = hit
            .metadata
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("untitled");
        println!("{}. [score: {:.3}] {}", i + 1, hit.score, title);
        println!("   Document: {}", hit.document_id);

        if let Some(entities) = hit.metadata.get("entities").and_then(Value::as_array) {
            let values: Vec<&str> = entities
                .iter()
                .filter_map(|e| e.get("value").and_then(Value::as_str))
                .take(5)
                .collect();
            if !values.is_empty() {
                println!("   Entities: {}", values.join(", "));
            }
        }

        println!("   {}\n", preview(&hit.text, 200).replace('\n', " "));
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", text[..idx].trim_end()),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::DocumentInput;
    use tempfile::TempDir;

    #[test]
    fn test_parse_filter() {
        assert_eq!(
            parse_filter("source_type=vulnerability").unwrap(),
            ("source_type".to_string(), Value::String("vulnerability".to_string()))
        );
        assert_eq!(
            parse_filter("sequence_index = 0").unwrap(),
            ("sequence_index".to_string(), Value::from(0))
        );
        assert!(parse_filter("no-separator").is_err());
        assert!(parse_filter("=value").is_err());
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let text = "é".repeat(10);
        assert_eq!(preview(&text, 3), "ééé...");
        assert_eq!(preview("short", 10), "short");
    }

    #[tokio::test]
    async fn test_query_with_filter() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::with_root(tmp.path());
        config.embedding.dimension = 64;
        let kb = KnowledgeBase::open(config).await.unwrap();

        kb.ingest(
            DocumentInput::new("Ivanti advisory", "CVE-2024-21887 command injection in Ivanti Connect Secure")
                .with_source_type("vulnerability"),
        )
        .await
        .unwrap();
        kb.ingest(
            DocumentInput::new("Ivanti blog", "Threat actors chained Ivanti Connect Secure flaws")
                .with_source_type("news"),
        )
        .await
        .unwrap();

        let options = QueryOptions {
            k: Some(5),
            filters: vec!["source_type=news".to_string()],
            ..Default::default()
        };
        let result = cmd_query(&kb, "Ivanti Connect Secure", options).await.unwrap();

        assert_eq!(result.chunks_searched, 2);
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].metadata["title"], "Ivanti blog");
    }
}
