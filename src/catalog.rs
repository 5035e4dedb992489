//! Technique catalog loading.
//!
//! The catalog is a TOML reference table of ATT&CK-style techniques, loaded
//! once at startup and shared read-only behind an `Arc`. A malformed catalog
//! is fatal at startup, never at query time.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, ThreatScopeError};

#[derive(Debug, Clone, Deserialize)]
pub struct TechniqueEntry {
    /// Technique identifier, e.g. `T1059.001`.
    pub id: String,
    /// Human-readable name, e.g. `PowerShell`.
    pub name: String,
    #[serde(default)]
    pub tactic: Option<String>,
    /// Phrases matched exactly (case-insensitive) or fuzzily by token
    /// overlap.
    pub triggers: Vec<String>,
    /// Optional regex patterns counted as exact matches.
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TechniqueCatalog {
    pub techniques: Vec<TechniqueEntry>,
}

impl TechniqueCatalog {
    pub fn get(&self, id: &str) -> Option<&TechniqueEntry> {
        self.techniques.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.techniques.len()
    }

    pub fn is_empty(&self) -> bool {
        self.techniques.is_empty()
    }
}

pub fn load_catalog(path: &Path) -> Result<TechniqueCatalog> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ThreatScopeError::Catalog(format!(
            "failed to read catalog {}: {}",
            path.display(),
            e
        ))
    })?;

    let catalog: TechniqueCatalog = toml::from_str(&content)
        .map_err(|e| ThreatScopeError::Catalog(format!("failed to parse catalog: {}", e)))?;

    validate(&catalog)?;
    Ok(catalog)
}

fn validate(catalog: &TechniqueCatalog) -> Result<()> {
    if catalog.techniques.is_empty() {
        return Err(ThreatScopeError::Catalog(
            "catalog contains no techniques".to_string(),
        ));
    }

    let mut seen = std::collections::BTreeSet::new();
    for entry in &catalog.techniques {
        if entry.id.trim().is_empty() || entry.name.trim().is_empty() {
            return Err(ThreatScopeError::Catalog(
                "technique entries require a non-empty id and name".to_string(),
            ));
        }
        if !seen.insert(entry.id.as_str()) {
            return Err(ThreatScopeError::Catalog(format!(
                "duplicate technique id: {}",
                entry.id
            )));
        }
        if entry.triggers.is_empty() && entry.patterns.is_empty() {
            return Err(ThreatScopeError::Catalog(format!(
                "technique {} has no triggers or patterns",
                entry.id
            )));
        }
        for pattern in &entry.patterns {
            regex::Regex::new(pattern).map_err(|e| {
                ThreatScopeError::Catalog(format!(
                    "technique {} has an invalid pattern '{}': {}",
                    entry.id, pattern, e
                ))
            })?;
        }
    }

    Ok(())
}
