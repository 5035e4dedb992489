//! Indicator-of-compromise extraction.
//!
//! A fixed, ordered set of typed recognizers runs over refanged chunk text.
//! Earlier recognizers claim their spans; later matches overlapping a
//! claimed span are dropped, so `8.8.8.8` is an IP and never also a domain.
//! Matches canonicalize (hashes and domains lowercased, CVE ids uppercased,
//! IPs validated by parsing) and deduplicate by `(type, value)` with
//! chunk-set union and max confidence. Extraction is idempotent and merges
//! are order-independent.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, ThreatScopeError};
use crate::models::{Chunk, Ioc, IocType};

/// Final domain labels that are almost always file extensions in report
/// text. Dropping them trades a little recall for a lot of precision.
const EXTENSION_LABELS: &[&str] = &[
    "exe", "dll", "bat", "ps1", "sh", "py", "js", "vbs", "bin", "dat", "tmp", "doc", "docx",
    "xls", "xlsx", "pdf", "txt", "log", "zip", "rar", "7z", "ini", "sys", "lnk", "iso", "img",
    "msi", "scr", "jar",
];

struct Recognizer {
    ioc_type: IocType,
    pattern: Regex,
    base_confidence: f64,
}

/// The extractor. Constructed once, then shared read-only.
pub struct IocExtractor {
    recognizers: Vec<Recognizer>,
}

impl IocExtractor {
    pub fn new() -> Result<Self> {
        // Order defines claim priority.
        let specs: [(IocType, &str, f64); 8] = [
            (IocType::Ip, r"\b(?:\d{1,3}\.){3}\d{1,3}\b", 0.95),
            (
                IocType::Ip,
                r"\b(?:[0-9a-fA-F]{1,4}:){3,7}[0-9a-fA-F]{1,4}\b",
                0.95,
            ),
            (IocType::Cve, r"(?i)\bCVE-\d{4}-\d{4,7}\b", 0.95),
            (
                IocType::Hash,
                r"\b(?:[A-Fa-f0-9]{64}|[A-Fa-f0-9]{40}|[A-Fa-f0-9]{32})\b",
                0.9,
            ),
            (
                IocType::Email,
                r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
                0.85,
            ),
            (
                IocType::Domain,
                r"(?i)\b(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,24}\b",
                0.75,
            ),
            (
                IocType::Path,
                r#"(?:[A-Za-z]:\\|\\\\)[^\s"'<>|]+"#,
                0.5,
            ),
            (
                IocType::Path,
                r#"/(?:etc|tmp|var|usr|home|opt|bin|sbin|dev|proc|srv|root)/[^\s"'<>|:,;]+"#,
                0.5,
            ),
        ];

        let mut recognizers = Vec::with_capacity(specs.len());
        for (ioc_type, pattern, base_confidence) in specs {
            let pattern = Regex::new(pattern).map_err(|e| {
                ThreatScopeError::Config(format!("ioc recognizer for {}: {}", ioc_type, e))
            })?;
            recognizers.push(Recognizer {
                ioc_type,
                pattern,
                base_confidence,
            });
        }

        Ok(Self { recognizers })
    }

    /// Scan free text for indicators. Used for chunks and for queries.
    pub fn scan_text(&self, text: &str) -> Vec<(IocType, String, f64)> {
        let refanged = refang(text);
        let mut claimed: Vec<(usize, usize)> = Vec::new();
        let mut found = Vec::new();

        for recognizer in &self.recognizers {
            for m in recognizer.pattern.find_iter(&refanged) {
                if claimed
                    .iter()
                    .any(|&(s, e)| m.start() < e && s < m.end())
                {
                    continue;
                }
                let Some(value) = canonicalize(recognizer.ioc_type, m.as_str()) else {
                    continue;
                };
                claimed.push((m.start(), m.end()));
                found.push((recognizer.ioc_type, value, recognizer.base_confidence));
            }
        }

        found
    }

    /// Extract and deduplicate indicators from a set of chunks.
    pub fn extract(&self, chunks: &[Chunk]) -> IocSet {
        let mut set = IocSet::new();
        for chunk in chunks {
            for (ioc_type, value, confidence) in self.scan_text(&chunk.text) {
                set.insert_sighting(ioc_type, value, confidence, &chunk.id);
            }
        }
        set
    }
}

/// Strip common defang conventions before matching.
pub fn refang(text: &str) -> String {
    text.replace("[.]", ".")
        .replace("(.)", ".")
        .replace("[dot]", ".")
        .replace("(dot)", ".")
        .replace("hxxp", "http")
        .replace("hXXp", "http")
        .replace("HXXP", "HTTP")
        .replace("[:]", ":")
        .replace("[@]", "@")
        .replace("[at]", "@")
        .replace("(at)", "@")
}

fn canonicalize(ioc_type: IocType, raw: &str) -> Option<String> {
    match ioc_type {
        IocType::Ip => {
            if let Ok(v4) = raw.parse::<Ipv4Addr>() {
                return Some(v4.to_string());
            }
            raw.parse::<Ipv6Addr>().ok().map(|v6| v6.to_string())
        }
        IocType::Domain => {
            let value = raw.to_lowercase();
            let value = value.trim_end_matches('.');
            let last = value.rsplit('.').next().unwrap_or_default();
            if EXTENSION_LABELS.contains(&last) {
                return None;
            }
            Some(value.to_string())
        }
        IocType::Hash => Some(raw.to_lowercase()),
        IocType::Cve => Some(raw.to_uppercase()),
        IocType::Email => Some(raw.to_lowercase()),
        IocType::Path => {
            let value = raw.trim_end_matches(['.', ',', ';', ')']);
            if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        }
    }
}

/// Deduplicated indicators keyed by `(type, value)`.
#[derive(Debug, Default)]
pub struct IocSet {
    entries: BTreeMap<(IocType, String), Ioc>,
}

impl IocSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sighting: union the chunk, keep the max confidence.
    pub fn insert_sighting(
        &mut self,
        ioc_type: IocType,
        value: String,
        confidence: f64,
        chunk_id: &str,
    ) {
        let entry = self
            .entries
            .entry((ioc_type, value.clone()))
            .or_insert_with(|| Ioc {
                id: Uuid::new_v4().to_string(),
                ioc_type,
                value,
                confidence: 0.0,
                enrichment: None,
                chunk_ids: Default::default(),
            });
        entry.confidence = entry.confidence.max(confidence).clamp(0.0, 1.0);
        entry.chunk_ids.insert(chunk_id.to_string());
    }

    /// Merge another set into this one. Order-independent: confidences take
    /// the max, chunk sets union, and of two provisional ids the
    /// lexicographically smaller survives.
    pub fn merge(&mut self, other: IocSet) {
        for (key, ioc) in other.entries {
            match self.entries.get_mut(&key) {
                Some(existing) => {
                    existing.confidence = existing.confidence.max(ioc.confidence);
                    existing.chunk_ids.extend(ioc.chunk_ids);
                    if ioc.id < existing.id {
                        existing.id = ioc.id;
                    }
                    if existing.enrichment.is_none() {
                        existing.enrichment = ioc.enrichment;
                    }
                }
                None => {
                    self.entries.insert(key, ioc);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ioc> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Ioc> {
        self.entries.values_mut()
    }

    /// Consume into a vec ordered by `(type, value)`.
    pub fn into_vec(self) -> Vec<Ioc> {
        self.entries.into_values().collect()
    }
}

/// Optional enrichment backend. Failure is non-fatal: the indicator is kept
/// without enrichment.
#[async_trait]
pub trait IocEnricher: Send + Sync {
    async fn enrich(&self, ioc: &Ioc) -> Result<BTreeMap<String, String>>;
}

/// Offline enrichment from the indicator value alone: address scope for
/// IPs, the final label for domains.
pub struct NetScopeEnricher;

#[async_trait]
impl IocEnricher for NetScopeEnricher {
    async fn enrich(&self, ioc: &Ioc) -> Result<BTreeMap<String, String>> {
        let mut map = BTreeMap::new();
        match ioc.ioc_type {
            IocType::Ip => {
                if let Ok(v4) = ioc.value.parse::<Ipv4Addr>() {
                    let scope = if v4.is_loopback() {
                        "loopback"
                    } else if v4.is_private() {
                        "private"
                    } else {
                        "public"
                    };
                    map.insert("scope".to_string(), scope.to_string());
                }
            }
            IocType::Domain => {
                if let Some(tld) = ioc.value.rsplit('.').next() {
                    map.insert("tld".to_string(), tld.to_string());
                }
            }
            _ => {}
        }
        Ok(map)
    }
}

/// Run enrichment over every indicator in the set. An unavailable backend
/// logs a warning and leaves the indicator unenriched; applying the same
/// enrichment twice produces the same record.
pub async fn apply_enrichment(set: &mut IocSet, enricher: &dyn IocEnricher) {
    for ioc in set.iter_mut() {
        match enricher.enrich(ioc).await {
            Ok(map) if !map.is_empty() => ioc.enrichment = Some(map),
            Ok(_) => {}
            Err(e) => {
                warn!(ioc_type = %ioc.ioc_type, value = %ioc.value, error = %e,
                    "enrichment skipped");
            }
        }
    }
}
