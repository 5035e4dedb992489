use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Result, ThreatScopeError};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub mapper: MapperConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    /// Path to the technique catalog TOML file.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: default_max_chunk_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chunk_chars() -> usize {
    800
}
fn default_overlap_chars() -> usize {
    200
}

/// Technique matching thresholds and weights.
#[derive(Debug, Deserialize, Clone)]
pub struct MapperConfig {
    /// Minimum token-overlap ratio for a fuzzy trigger match.
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
    /// Confidence assigned to an exact phrase or pattern match.
    #[serde(default = "default_exact_weight")]
    pub exact_weight: f64,
    /// Scale applied to the overlap ratio of a fuzzy match.
    #[serde(default = "default_fuzzy_weight")]
    pub fuzzy_weight: f64,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: default_fuzzy_threshold(),
            exact_weight: default_exact_weight(),
            fuzzy_weight: default_fuzzy_weight(),
        }
    }
}

fn default_fuzzy_threshold() -> f64 {
    0.5
}
fn default_exact_weight() -> f64 {
    1.0
}
fn default_fuzzy_weight() -> f64 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of chunks returned to the generator.
    #[serde(default = "default_final_k")]
    pub final_k: usize,
    /// Candidates fetched per requested result before re-ranking.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    /// Similarity floor. Candidates below it are dropped; 0 disables.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    /// Re-rank bonus per unit of technique overlap with the query.
    #[serde(default = "default_entity_boost")]
    pub technique_boost: f64,
    /// Re-rank bonus per unit of IOC overlap with the query.
    #[serde(default = "default_entity_boost")]
    pub ioc_boost: f64,
    /// Token-set Jaccard ratio above which two chunks of one document are
    /// treated as the same window.
    #[serde(default = "default_dedup_similarity")]
    pub dedup_similarity: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            final_k: default_final_k(),
            candidate_multiplier: default_candidate_multiplier(),
            min_similarity: default_min_similarity(),
            technique_boost: default_entity_boost(),
            ioc_boost: default_entity_boost(),
            dedup_similarity: default_dedup_similarity(),
        }
    }
}

fn default_final_k() -> usize {
    6
}
fn default_candidate_multiplier() -> usize {
    4
}
fn default_min_similarity() -> f64 {
    0.25
}
fn default_entity_boost() -> f64 {
    0.05
}
fn default_dedup_similarity() -> f64 {
    0.6
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    /// Budget for retrieved context in the prompt, in characters.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    /// Deadline for a single model invocation.
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    /// Optional directory of per-mode prompt templates
    /// (`prompt_ir.txt`, `prompt_intel.txt`, `prompt_hybrid.txt`).
    #[serde(default)]
    pub prompt_dir: Option<PathBuf>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            max_context_chars: default_max_context_chars(),
            timeout_secs: default_generation_timeout_secs(),
            prompt_dir: None,
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_context_chars() -> usize {
    6000
}
fn default_generation_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Documents processed concurrently.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Deadline for embedding one document's chunks during ingestion.
    #[serde(default = "default_embed_timeout_secs")]
    pub embed_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_concurrency: default_max_concurrency(),
            embed_timeout_secs: default_embed_timeout_secs(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.txt".to_string(),
        "**/*.log".to_string(),
        "**/*.pdf".to_string(),
    ]
}
fn default_max_concurrency() -> usize {
    4
}
fn default_embed_timeout_secs() -> u64 {
    120
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ThreatScopeError::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| ThreatScopeError::Config(format!("failed to parse config file: {}", e)))?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Chunking invariant: max_chunk_chars > overlap_chars > 0.
    if config.chunking.overlap_chars == 0 {
        return Err(ThreatScopeError::Config(
            "chunking.overlap_chars must be > 0".to_string(),
        ));
    }
    if config.chunking.max_chunk_chars <= config.chunking.overlap_chars {
        return Err(ThreatScopeError::Config(format!(
            "chunking.max_chunk_chars ({}) must be greater than chunking.overlap_chars ({})",
            config.chunking.max_chunk_chars, config.chunking.overlap_chars
        )));
    }

    if config.retrieval.final_k == 0 {
        return Err(ThreatScopeError::Config(
            "retrieval.final_k must be >= 1".to_string(),
        ));
    }
    if config.retrieval.candidate_multiplier == 0 {
        return Err(ThreatScopeError::Config(
            "retrieval.candidate_multiplier must be >= 1".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&config.retrieval.min_similarity) {
        return Err(ThreatScopeError::Config(
            "retrieval.min_similarity must be in [0.0, 1.0]".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&config.retrieval.dedup_similarity) {
        return Err(ThreatScopeError::Config(
            "retrieval.dedup_similarity must be in [0.0, 1.0]".to_string(),
        ));
    }
    if config.retrieval.technique_boost < 0.0 || config.retrieval.ioc_boost < 0.0 {
        return Err(ThreatScopeError::Config(
            "retrieval boosts must be >= 0".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&config.mapper.fuzzy_threshold) {
        return Err(ThreatScopeError::Config(
            "mapper.fuzzy_threshold must be in [0.0, 1.0]".to_string(),
        ));
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            return Err(ThreatScopeError::Config(format!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            )));
        }
        if config.embedding.model.is_none() {
            return Err(ThreatScopeError::Config(format!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            )));
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => {
            return Err(ThreatScopeError::Config(format!(
                "unknown embedding provider: '{}' (expected disabled, openai, or ollama)",
                other
            )))
        }
    }

    if config.generation.is_enabled() && config.generation.model.is_none() {
        return Err(ThreatScopeError::Config(format!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        )));
    }
    match config.generation.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => {
            return Err(ThreatScopeError::Config(format!(
                "unknown generation provider: '{}' (expected disabled, openai, or ollama)",
                other
            )))
        }
    }

    if config.ingest.max_concurrency == 0 {
        return Err(ThreatScopeError::Config(
            "ingest.max_concurrency must be >= 1".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml() -> String {
        r#"
[db]
path = "./data/threatscope.db"

[catalog]
path = "./data/techniques.toml"

[chunking]
max_chunk_chars = 800
overlap_chars = 200
"#
        .to_string()
    }

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)
            .map_err(|e| ThreatScopeError::Config(e.to_string()))?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse(&base_toml()).unwrap();
        assert_eq!(config.retrieval.final_k, 6);
        assert_eq!(config.retrieval.candidate_multiplier, 4);
        assert!(!config.embedding.is_enabled());
        assert!(!config.generation.is_enabled());
        assert_eq!(config.ingest.max_concurrency, 4);
    }

    #[test]
    fn test_chunking_section_optional() {
        let toml_str = "[db]\npath = \"./x.db\"\n\n[catalog]\npath = \"./t.toml\"\n";
        let config = parse(toml_str).unwrap();
        assert_eq!(config.chunking.max_chunk_chars, 800);
        assert_eq!(config.chunking.overlap_chars, 200);
    }

    #[test]
    fn test_overlap_must_be_positive() {
        let toml_str = base_toml().replace("overlap_chars = 200", "overlap_chars = 0");
        let err = parse(&toml_str).unwrap_err();
        assert!(matches!(err, ThreatScopeError::Config(_)));
    }

    #[test]
    fn test_overlap_must_be_below_max() {
        let toml_str = base_toml().replace("max_chunk_chars = 800", "max_chunk_chars = 200");
        let err = parse(&toml_str).unwrap_err();
        assert!(matches!(err, ThreatScopeError::Config(_)));
    }

    #[test]
    fn test_embedding_requires_model_and_dims() {
        let toml_str = format!("{}\n[embedding]\nprovider = \"ollama\"\n", base_toml());
        let err = parse(&toml_str).unwrap_err();
        assert!(matches!(err, ThreatScopeError::Config(_)));

        let toml_str = format!(
            "{}\n[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\ndims = 768\n",
            base_toml()
        );
        assert!(parse(&toml_str).is_ok());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let toml_str = format!(
            "{}\n[embedding]\nprovider = \"acme\"\nmodel = \"m\"\ndims = 4\n",
            base_toml()
        );
        let err = parse(&toml_str).unwrap_err();
        assert!(matches!(err, ThreatScopeError::Config(_)));
    }
}
