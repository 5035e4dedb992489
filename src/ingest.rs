//! Ingestion pipeline orchestration.
//!
//! Coordinates the full per-document flow: normalization → chunking →
//! technique annotation → IOC extraction → inline embedding (non-fatal on
//! failure) → transactional storage. A failure in one document never aborts
//! the rest of a batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::catalog::load_catalog;
use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, Config};
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{Result, ThreatScopeError};
use crate::ioc::{apply_enrichment, IocEnricher, IocExtractor, NetScopeEnricher};
use crate::loader::{self, ScannedFile};
use crate::migrate;
use crate::models::{Chunk, DocFormat, Document, EmbeddingRecord};
use crate::normalize;
use crate::store::Store;
use crate::techniques::TechniqueMapper;

/// Outcome of ingesting a single document.
#[derive(Debug, Clone)]
pub struct DocumentReport {
    pub document_id: String,
    pub source_uri: String,
    pub chunks: usize,
    pub techniques: usize,
    pub iocs: usize,
    pub embedded: usize,
    /// True when the source was unchanged since the last ingest and
    /// nothing was written.
    pub skipped: bool,
}

/// Aggregate outcome of an ingest batch. Failed documents are recorded
/// here instead of aborting the batch.
#[derive(Debug, Default)]
pub struct IngestSummary {
    pub reports: Vec<DocumentReport>,
    /// `(source_uri, error message)` per failed document.
    pub failures: Vec<(String, String)>,
}

pub struct IngestPipeline {
    store: Store,
    mapper: TechniqueMapper,
    extractor: IocExtractor,
    embedder: Arc<dyn EmbeddingProvider>,
    enricher: Option<Arc<dyn IocEnricher>>,
    chunking: ChunkingConfig,
    embed_enabled: bool,
    embed_timeout: Duration,
}

impl IngestPipeline {
    /// Assemble a pipeline from explicit parts. Embedding is considered
    /// enabled when the provider reports nonzero dimensions.
    pub fn new(
        store: Store,
        mapper: TechniqueMapper,
        extractor: IocExtractor,
        embedder: Arc<dyn EmbeddingProvider>,
        chunking: ChunkingConfig,
        embed_timeout: Duration,
    ) -> Self {
        let embed_enabled = embedder.dims() > 0;
        Self {
            store,
            mapper,
            extractor,
            embedder,
            enricher: Some(Arc::new(NetScopeEnricher)),
            chunking,
            embed_enabled,
            embed_timeout,
        }
    }

    pub fn from_config(config: &Config, pool: SqlitePool) -> Result<Self> {
        let catalog = load_catalog(&config.catalog.path)?;
        let mapper = TechniqueMapper::new(&catalog, config.mapper.clone())?;
        let extractor = IocExtractor::new()?;
        let embedder = create_provider(&config.embedding)?;
        let mut pipeline = Self::new(
            Store::new(pool),
            mapper,
            extractor,
            embedder,
            config.chunking.clone(),
            Duration::from_secs(config.ingest.embed_timeout_secs),
        );
        pipeline.embed_enabled = config.embedding.is_enabled();
        Ok(pipeline)
    }

    /// Replaces the default enricher, or disables enrichment with `None`.
    pub fn with_enricher(mut self, enricher: Option<Arc<dyn IocEnricher>>) -> Self {
        self.enricher = enricher;
        self
    }

    /// Ingest one document from raw bytes.
    ///
    /// Re-ingesting the same `source_uri` with unchanged content is a no-op
    /// (reported with `skipped = true`). Changed content replaces the prior
    /// document bundle under the same document id.
    pub async fn ingest_bytes(
        &self,
        source_uri: &str,
        title: Option<String>,
        bytes: &[u8],
        format: DocFormat,
    ) -> Result<DocumentReport> {
        let normalized = normalize::normalize(bytes, format)?;
        let hash = dedup_hash(source_uri, format, &normalized.text);

        let document_id = match self.store.find_document_by_uri(source_uri).await? {
            Some((id, existing_hash)) if existing_hash == hash => {
                debug!(source_uri, document_id = %id, "unchanged, skipping");
                return Ok(DocumentReport {
                    document_id: id,
                    source_uri: source_uri.to_string(),
                    chunks: 0,
                    techniques: 0,
                    iocs: 0,
                    embedded: 0,
                    skipped: true,
                });
            }
            Some((id, _)) => id,
            None => Uuid::new_v4().to_string(),
        };

        let chunks = chunk_text(&document_id, &normalized.text, &self.chunking)?;

        let mut annotations = Vec::new();
        for chunk in &chunks {
            annotations.extend(self.mapper.annotate_chunk(chunk));
        }

        let mut ioc_set = self.extractor.extract(&chunks);
        if let Some(enricher) = &self.enricher {
            apply_enrichment(&mut ioc_set, enricher.as_ref()).await;
        }
        let iocs = ioc_set.into_vec();

        let records = if self.embed_enabled && !chunks.is_empty() {
            self.embed_chunks(&chunks).await
        } else {
            Vec::new()
        };

        let document = Document {
            id: document_id.clone(),
            source_uri: source_uri.to_string(),
            title,
            format,
            body: normalized.text,
            dedup_hash: hash,
            ingested_at: chrono::Utc::now().timestamp(),
        };

        let report = DocumentReport {
            document_id,
            source_uri: source_uri.to_string(),
            chunks: chunks.len(),
            techniques: annotations.len(),
            iocs: iocs.len(),
            embedded: records.len(),
            skipped: false,
        };

        self.store
            .upsert_document_bundle(&document, &chunks, &annotations, &iocs, &records)
            .await?;

        debug!(
            source_uri,
            document_id = %report.document_id,
            chunks = report.chunks,
            techniques = report.techniques,
            iocs = report.iocs,
            "document ingested"
        );
        Ok(report)
    }

    /// Ingest one file from disk, detecting its format from the extension
    /// and content.
    pub async fn ingest_file(&self, path: &Path, uri: &str) -> Result<DocumentReport> {
        let bytes = std::fs::read(path)?;
        let format = normalize::detect_format(path, &bytes)?;
        let title = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned());
        self.ingest_bytes(uri, title, &bytes, format).await
    }

    /// Ingest a batch of files concurrently, at most `max_concurrency`
    /// documents in flight. Per-document errors become summary failures;
    /// the surviving documents are still committed.
    pub async fn ingest_many(
        self: Arc<Self>,
        files: Vec<ScannedFile>,
        max_concurrency: usize,
    ) -> IngestSummary {
        let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for file in files {
            let pipeline = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => pipeline.ingest_file(&file.path, &file.uri).await,
                    Err(_) => Err(ThreatScopeError::Config(
                        "ingest scheduler shut down".to_string(),
                    )),
                };
                (file.uri, result)
            });
        }

        let mut summary = IngestSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(report))) => summary.reports.push(report),
                Ok((uri, Err(err))) => {
                    warn!(source_uri = %uri, error = %err, "document ingest failed");
                    summary.failures.push((uri, err.to_string()));
                }
                Err(join_err) => {
                    warn!(error = %join_err, "ingest task aborted");
                    summary
                        .failures
                        .push(("(ingest task)".to_string(), join_err.to_string()));
                }
            }
        }

        summary
            .reports
            .sort_by(|a, b| a.source_uri.cmp(&b.source_uri));
        summary.failures.sort();
        summary
    }

    /// Embed chunk texts inline, bounded by the configured timeout. Any
    /// failure leaves the chunks pending for `tscope embed pending`.
    async fn embed_chunks(&self, chunks: &[Chunk]) -> Vec<EmbeddingRecord> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embedded = tokio::time::timeout(self.embed_timeout, self.embedder.embed(&texts)).await;
        let vectors = match embedded {
            Ok(Ok(vectors)) => vectors,
            Ok(Err(err)) => {
                warn!(error = %err, "inline embedding failed, chunks left pending");
                return Vec::new();
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.embed_timeout.as_secs(),
                    "inline embedding timed out, chunks left pending"
                );
                return Vec::new();
            }
        };
        if vectors.len() != chunks.len() {
            warn!(
                expected = chunks.len(),
                got = vectors.len(),
                "embedding provider returned a partial batch, chunks left pending"
            );
            return Vec::new();
        }
        chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| EmbeddingRecord {
                chunk_id: chunk.id.clone(),
                document_id: chunk.document_id.clone(),
                model: self.embedder.model_name().to_string(),
                dims: self.embedder.dims(),
                vector,
                hash: chunk.hash.clone(),
            })
            .collect()
    }
}

/// Content hash used to skip unchanged documents across ingests.
pub fn dedup_hash(source_uri: &str, format: DocFormat, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_uri.as_bytes());
    hasher.update([0u8]);
    hasher.update(format.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub async fn run_ingest(
    config: &Config,
    paths: &[PathBuf],
    dry_run: bool,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let mut files = loader::scan_paths(paths, &config.ingest)?;
    let found = files.len();
    if let Some(limit) = limit {
        files.truncate(limit);
    }

    if dry_run {
        println!("ingest (dry-run)");
        println!("  files found: {}", found);
        for file in &files {
            println!("  would ingest: {}", file.uri);
        }
        println!("ok");
        return Ok(());
    }

    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;

    let pipeline = Arc::new(IngestPipeline::from_config(config, pool.clone())?);
    let summary = pipeline
        .ingest_many(files, config.ingest.max_concurrency)
        .await;

    let ingested = summary.reports.iter().filter(|r| !r.skipped).count();
    let skipped = summary.reports.iter().filter(|r| r.skipped).count();
    let chunks: usize = summary.reports.iter().map(|r| r.chunks).sum();
    let techniques: usize = summary.reports.iter().map(|r| r.techniques).sum();
    let iocs: usize = summary.reports.iter().map(|r| r.iocs).sum();
    let embedded: usize = summary.reports.iter().map(|r| r.embedded).sum();

    println!("ingest");
    println!("  files found: {}", found);
    println!("  documents ingested: {}", ingested);
    println!("  unchanged (skipped): {}", skipped);
    println!("  chunks written: {}", chunks);
    println!("  technique annotations: {}", techniques);
    println!("  iocs: {}", iocs);
    if config.embedding.is_enabled() {
        println!("  embeddings written: {}", embedded);
        println!("  embeddings pending: {}", chunks.saturating_sub(embedded));
    }
    if !summary.failures.is_empty() {
        println!("  failures: {}", summary.failures.len());
        for (uri, err) in &summary.failures {
            println!("    {}: {}", uri, err);
        }
    }
    println!("ok");

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_hash_is_deterministic() {
        let a = dedup_hash("file:///r.txt", DocFormat::Txt, "body");
        let b = dedup_hash("file:///r.txt", DocFormat::Txt, "body");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_dedup_hash_changes_with_any_input() {
        let base = dedup_hash("file:///r.txt", DocFormat::Txt, "body");
        assert_ne!(base, dedup_hash("file:///s.txt", DocFormat::Txt, "body"));
        assert_ne!(base, dedup_hash("file:///r.txt", DocFormat::Log, "body"));
        assert_ne!(base, dedup_hash("file:///r.txt", DocFormat::Txt, "other"));
    }
}
