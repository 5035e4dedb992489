//! Chunk-to-technique mapping.
//!
//! The mapper compiles the catalog once (lowered phrases, per-trigger token
//! sets, regex patterns) and then matches chunks locally: an exact
//! case-insensitive phrase or pattern hit scores `exact_weight`, a token-set
//! overlap at or above `fuzzy_threshold` scores `fuzzy_weight` times the
//! overlap ratio. A technique's confidence is the max over its triggers,
//! never a sum, and multiple techniques can annotate one chunk.

use std::collections::BTreeSet;

use regex::Regex;

use crate::catalog::TechniqueCatalog;
use crate::config::MapperConfig;
use crate::error::{Result, ThreatScopeError};
use crate::models::{Chunk, TechniqueAnnotation};

/// A technique match against arbitrary text, before it is tied to a chunk.
#[derive(Debug, Clone)]
pub struct TechniqueMatch {
    pub technique_id: String,
    pub technique_name: String,
    pub confidence: f64,
    pub matched_terms: Vec<String>,
}

struct CompiledTechnique {
    id: String,
    name: String,
    phrases: Vec<String>,
    token_sets: Vec<BTreeSet<String>>,
    patterns: Vec<Regex>,
}

pub struct TechniqueMapper {
    techniques: Vec<CompiledTechnique>,
    config: MapperConfig,
}

impl TechniqueMapper {
    pub fn new(catalog: &TechniqueCatalog, config: MapperConfig) -> Result<Self> {
        let mut techniques = Vec::with_capacity(catalog.len());
        for entry in &catalog.techniques {
            let phrases: Vec<String> = entry.triggers.iter().map(|t| t.to_lowercase()).collect();
            let token_sets = phrases.iter().map(|p| tokenize(p)).collect();
            let patterns = entry
                .patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        ThreatScopeError::Catalog(format!(
                            "technique {} pattern '{}': {}",
                            entry.id, p, e
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            techniques.push(CompiledTechnique {
                id: entry.id.clone(),
                name: entry.name.clone(),
                phrases,
                token_sets,
                patterns,
            });
        }

        Ok(Self { techniques, config })
    }

    /// Match free text against the catalog. Used both for chunk annotation
    /// and for detecting techniques named in a query.
    pub fn map_text(&self, text: &str) -> Vec<TechniqueMatch> {
        let lower = text.to_lowercase();
        let text_tokens = tokenize(&lower);

        let mut matches = Vec::new();
        for tech in &self.techniques {
            let mut best = 0.0f64;
            let mut terms: BTreeSet<String> = BTreeSet::new();

            for (phrase, trigger_tokens) in tech.phrases.iter().zip(&tech.token_sets) {
                if lower.contains(phrase.as_str()) {
                    best = best.max(self.config.exact_weight);
                    terms.insert(phrase.clone());
                    continue;
                }
                if trigger_tokens.is_empty() {
                    continue;
                }
                let shared = trigger_tokens.intersection(&text_tokens).count();
                let ratio = shared as f64 / trigger_tokens.len() as f64;
                if ratio >= self.config.fuzzy_threshold && shared > 0 {
                    best = best.max(self.config.fuzzy_weight * ratio);
                    for token in trigger_tokens.intersection(&text_tokens) {
                        terms.insert(token.clone());
                    }
                }
            }

            for pattern in &tech.patterns {
                if let Some(found) = pattern.find(text) {
                    best = best.max(self.config.exact_weight);
                    terms.insert(found.as_str().to_lowercase());
                }
            }

            if best > 0.0 {
                matches.push(TechniqueMatch {
                    technique_id: tech.id.clone(),
                    technique_name: tech.name.clone(),
                    confidence: best.clamp(0.0, 1.0),
                    matched_terms: terms.into_iter().collect(),
                });
            }
        }

        matches.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.technique_id.cmp(&b.technique_id))
        });
        matches
    }

    /// Annotate one chunk with every technique it matches.
    pub fn annotate_chunk(&self, chunk: &Chunk) -> Vec<TechniqueAnnotation> {
        self.map_text(&chunk.text)
            .into_iter()
            .map(|m| TechniqueAnnotation {
                chunk_id: chunk.id.clone(),
                technique_id: m.technique_id,
                technique_name: m.technique_name,
                confidence: m.confidence,
                matched_terms: m.matched_terms,
            })
            .collect()
    }
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}
