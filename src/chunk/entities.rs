//! Structured security tokens that must never be split across chunks

use crate::error::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Kind of a recognised token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Cve,
    Url,
    Email,
    Ipv4,
    Ipv6,
    Sha256,
    Sha1,
    Md5,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Cve => "cve",
            EntityKind::Url => "url",
            EntityKind::Email => "email",
            EntityKind::Ipv4 => "ipv4",
            EntityKind::Ipv6 => "ipv6",
            EntityKind::Sha256 => "sha256",
            EntityKind::Sha1 => "sha1",
            EntityKind::Md5 => "md5",
        }
    }
}

/// A token's byte span in the scanned text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySpan {
    pub kind: EntityKind,
    pub start: usize,
    pub end: usize,
}

impl EntitySpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `pos` falls strictly inside the span
    pub fn splits_at(&self, pos: usize) -> bool {
        self.start < pos && pos < self.end
    }
}

/// An entity recorded in chunk metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub value: String,
}

const IPV4_OCTET: &str = r"(?:25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9]?[0-9])";
const IPV6: &str = concat!(
    r"(?:[0-9A-Fa-f]{1,4}:){7}[0-9A-Fa-f]{1,4}",
    r"|(?:[0-9A-Fa-f]{1,4}:){1,7}:(?:[0-9A-Fa-f]{1,4}(?::[0-9A-Fa-f]{1,4}){0,6})?",
    r"|::(?:[0-9A-Fa-f]{1,4}(?::[0-9A-Fa-f]{1,4}){0,6})"
);

/// Pattern set used by the entity-aware chunker.
///
/// Patterns are tried in order; the scan result is the union of all
/// matches with overlapping spans merged into one.
pub struct EntityScanner {
    patterns: Vec<(EntityKind, Regex)>,
}

impl EntityScanner {
    pub fn new() -> Result<Self> {
        let ipv4 = format!(r"\b{o}\.{o}\.{o}\.{o}\b", o = IPV4_OCTET);

        let patterns = vec![
            (EntityKind::Cve, Regex::new(r"CVE-\d{4}-\d{4,}")?),
            (EntityKind::Url, Regex::new(r#"https?://[^\s<>"'`]+"#)?),
            (
                EntityKind::Email,
                Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")?,
            ),
            (EntityKind::Ipv4, Regex::new(&ipv4)?),
            (EntityKind::Ipv6, Regex::new(IPV6)?),
            (EntityKind::Sha256, Regex::new(r"\b[0-9A-Fa-f]{64}\b")?),
            (EntityKind::Sha1, Regex::new(r"\b[0-9A-Fa-f]{40}\b")?),
            (EntityKind::Md5, Regex::new(r"\b[0-9A-Fa-f]{32}\b")?),
        ];

        Ok(Self { patterns })
    }

    /// Scan `text`, returning sorted, non-overlapping spans.
    ///
    /// When two matches overlap the merged span keeps the kind of the one
    /// that starts first (longest on a tie).
    pub fn scan(&self, text: &str) -> Vec<EntitySpan> {
        let mut spans = Vec::new();

        for (kind, regex) in &self.patterns {
            for m in regex.find_iter(text) {
                let end = match kind {
                    EntityKind::Url => m.start() + trim_url(m.as_str()).len(),
                    // Rejects "::" and path separators such as "std::fmt"
                    EntityKind::Ipv6
                        if m.as_str().len() < 3 || !is_delimited(text, m.start(), m.end()) =>
                    {
                        continue
                    }
                    _ => m.end(),
                };
                if end > m.start() {
                    spans.push(EntitySpan {
                        kind: *kind,
                        start: m.start(),
                        end,
                    });
                }
            }
        }

        merge_spans(spans)
    }

    /// Entities lying entirely within `[start, end)`
    pub fn entities_in(
        spans: &[EntitySpan],
        text: &str,
        start: usize,
        end: usize,
    ) -> Vec<Entity> {
        spans
            .iter()
            .filter(|s| s.start >= start && s.end <= end)
            .map(|s| Entity {
                kind: s.kind,
                value: text[s.start..s.end].to_string(),
            })
            .collect()
    }
}

/// Trailing punctuation is almost never part of a URL in prose
fn trim_url(url: &str) -> &str {
    url.trim_end_matches(['.', ',', ';', ':', '!', '?', ')', ']', '}'])
}

fn is_delimited(text: &str, start: usize, end: usize) -> bool {
    let glued = |c: char| c.is_alphanumeric() || c == '_' || c == ':';
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(glued) && !after.is_some_and(glued)
}

fn merge_spans(mut spans: Vec<EntitySpan>) -> Vec<EntitySpan> {
    spans.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

    let mut merged: Vec<EntitySpan> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start < last.end => {
                last.end = last.end.max(span.end);
            }
            _ => merged.push(span),
        }
    }
    merged
}

/// Span of the entity that `pos` falls strictly inside, if any
pub fn entity_splitting(spans: &[EntitySpan], pos: usize) -> Option<&EntitySpan> {
    // Spans are sorted and disjoint
    let idx = spans.partition_point(|s| s.end <= pos);
    spans.get(idx).filter(|s| s.splits_at(pos))
}
