//! Core data models used throughout ThreatScope.
//!
//! These types represent the documents, chunks, annotations, and indicators
//! that flow through the ingestion and retrieval pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Input format accepted by the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocFormat {
    Pdf,
    Txt,
    Log,
}

impl DocFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocFormat::Pdf => "pdf",
            DocFormat::Txt => "txt",
            DocFormat::Log => "log",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "pdf" => Some(DocFormat::Pdf),
            "txt" | "text" => Some(DocFormat::Txt),
            "log" => Some(DocFormat::Log),
            _ => None,
        }
    }

    /// Classify a file by its extension alone.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_name)
    }
}

impl fmt::Display for DocFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized threat report stored in SQLite. Immutable once ingested;
/// re-ingesting the same `source_uri` replaces the whole record atomically.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub source_uri: String,
    pub title: Option<String>,
    pub format: DocFormat,
    /// Canonical normalized text (the chunker's input).
    pub body: String,
    /// SHA-256 over source URI, format, and body. Unchanged hash on
    /// re-ingest means the document is skipped.
    pub dedup_hash: String,
    pub ingested_at: i64,
}

/// A window of a document's normalized text.
///
/// Spans are byte offsets into [`Document::body`]. Consecutive chunks of a
/// document overlap by the configured amount; `overlap_with_prev` marks every
/// chunk whose span starts before the previous chunk's span ends.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: i64,
    pub text: String,
    pub span_start: i64,
    pub span_end: i64,
    pub overlap_with_prev: bool,
    /// SHA-256 of the chunk text, used for embedding staleness detection.
    pub hash: String,
}

/// A catalog technique matched against a chunk.
#[derive(Debug, Clone, Serialize)]
pub struct TechniqueAnnotation {
    pub chunk_id: String,
    pub technique_id: String,
    pub technique_name: String,
    /// In `[0, 1]`. Max over the technique's triggers, never a sum.
    pub confidence: f64,
    pub matched_terms: Vec<String>,
}

/// Indicator-of-compromise categories recognized by the extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IocType {
    Ip,
    Domain,
    Hash,
    Cve,
    Path,
    Email,
}

impl IocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IocType::Ip => "ip",
            IocType::Domain => "domain",
            IocType::Hash => "hash",
            IocType::Cve => "cve",
            IocType::Path => "path",
            IocType::Email => "email",
        }
    }
}

impl FromStr for IocType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ip" => Ok(IocType::Ip),
            "domain" => Ok(IocType::Domain),
            "hash" => Ok(IocType::Hash),
            "cve" => Ok(IocType::Cve),
            "path" => Ok(IocType::Path),
            "email" => Ok(IocType::Email),
            other => Err(format!(
                "unknown ioc type '{}' (expected ip, domain, hash, cve, path, or email)",
                other
            )),
        }
    }
}

impl fmt::Display for IocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An extracted indicator, deduplicated by `(ioc_type, value)`.
///
/// The value is canonical: defang markers stripped, hashes and domains
/// lowercased, CVE identifiers uppercased. `chunk_ids` is the union of every
/// chunk the indicator was seen in.
#[derive(Debug, Clone, Serialize)]
pub struct Ioc {
    pub id: String,
    pub ioc_type: IocType,
    pub value: String,
    /// In `[0, 1]`. Max across sightings; heuristic recognizers carry a
    /// lower base.
    pub confidence: f64,
    pub enrichment: Option<BTreeMap<String, String>>,
    pub chunk_ids: BTreeSet<String>,
}

/// One stored vector per `(chunk_id, model)`.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub model: String,
    pub dims: usize,
    pub vector: Vec<f32>,
    /// Chunk text hash at embedding time; a differing chunk hash marks the
    /// record stale.
    pub hash: String,
}

/// A chunk reference produced at answer time. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub chunk_id: String,
    pub document_id: String,
    pub span_start: i64,
    pub span_end: i64,
}
