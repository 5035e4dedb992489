//! Retrieval: vector candidates, entity-aware re-ranking, dedup.
//!
//! The retriever overfetches `k * candidate_multiplier` candidates from the
//! vector index (with any technique or indicator filters applied there),
//! hydrates them, then re-ranks: a chunk sharing techniques or indicators
//! with the question gets a small additive boost on top of its cosine
//! similarity, capped at 1.0. Near-duplicate results are collapsed, keeping
//! the higher-ranked one. A question with no recognizable entities ranks
//! purely by similarity.
//!
//! An empty corpus or empty question yields an empty result, never an
//! error. The similarity floor applies to raw similarity before boosts; a
//! floor of zero disables it.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::debug;

use crate::catalog;
use crate::config::{Config, RetrievalConfig};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{Result, ThreatScopeError};
use crate::index::{QueryFilter, VectorIndex};
use crate::ioc::IocExtractor;
use crate::models::{Chunk, Ioc, IocType, TechniqueAnnotation};
use crate::store::Store;
use crate::techniques::TechniqueMapper;

/// A ranked retrieval result with everything the generator needs.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    /// Raw cosine similarity clamped to `[0, 1]`.
    pub similarity: f64,
    /// Similarity plus entity-overlap boosts, capped at 1.0.
    pub score: f64,
    pub techniques: Vec<TechniqueAnnotation>,
    pub iocs: Vec<Ioc>,
}

pub struct Retriever {
    store: Store,
    index: VectorIndex,
    mapper: Arc<TechniqueMapper>,
    extractor: Arc<IocExtractor>,
    embedder: Arc<dyn EmbeddingProvider>,
    params: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        store: Store,
        index: VectorIndex,
        mapper: Arc<TechniqueMapper>,
        extractor: Arc<IocExtractor>,
        embedder: Arc<dyn EmbeddingProvider>,
        params: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            index,
            mapper,
            extractor,
            embedder,
            params,
        }
    }

    /// Assemble a retriever from configuration and an open pool.
    pub fn from_config(config: &Config, pool: SqlitePool) -> Result<Self> {
        let catalog = catalog::load_catalog(&config.catalog.path)?;
        let mapper = Arc::new(TechniqueMapper::new(&catalog, config.mapper.clone())?);
        let extractor = Arc::new(IocExtractor::new()?);
        let embedder = embedding::create_provider(&config.embedding)?;

        Ok(Self::new(
            Store::new(pool.clone()),
            VectorIndex::new(pool),
            mapper,
            extractor,
            embedder,
            config.retrieval.clone(),
        ))
    }

    /// Retrieve the top `k` grounding chunks for a question.
    pub async fn retrieve(
        &self,
        question: &str,
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<RetrievedChunk>> {
        if question.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        // An index built by a different model cannot be compared against
        // this question's vector.
        match self.index.stored_model().await? {
            None => return Ok(Vec::new()),
            Some((stored, _)) if stored != self.embedder.model_name() => {
                return Err(ThreatScopeError::Config(format!(
                    "index was built with model '{}' but embedding.model is '{}'; run 'tscope embed rebuild'",
                    stored,
                    self.embedder.model_name()
                )));
            }
            Some(_) => {}
        }

        let query_vector = embedding::embed_query(self.embedder.as_ref(), question).await?;

        let floor = filter.min_score.unwrap_or(self.params.min_similarity);
        let fetch_k = k.saturating_mul(self.params.candidate_multiplier.max(1));
        let index_filter = QueryFilter {
            technique_ids: filter.technique_ids.clone(),
            ioc_types: filter.ioc_types.clone(),
            min_score: Some(floor),
        };

        let hits = self
            .index
            .query(&query_vector, fetch_k, &index_filter, self.embedder.model_name())
            .await?;

        let query_techniques: BTreeSet<String> = self
            .mapper
            .map_text(question)
            .into_iter()
            .map(|m| m.technique_id)
            .collect();
        let query_iocs: BTreeSet<(IocType, String)> = self
            .extractor
            .scan_text(question)
            .into_iter()
            .map(|(t, v, _)| (t, v))
            .collect();

        let mut candidates = Vec::with_capacity(hits.len());
        for hit in hits {
            // A chunk can disappear between index query and hydration if
            // its document was deleted concurrently. Skip it.
            let Some(chunk) = self.store.get_chunk(&hit.chunk_id).await? else {
                continue;
            };
            let techniques = self.store.annotations_for_chunk(&hit.chunk_id).await?;
            let iocs = self.store.iocs_for_chunk(&hit.chunk_id).await?;
            candidates.push(RetrievedChunk {
                chunk,
                similarity: hit.score,
                score: hit.score,
                techniques,
                iocs,
            });
        }

        let mut ranked = rerank(candidates, &query_techniques, &query_iocs, &self.params);
        ranked.truncate(k);

        debug!(
            question_len = question.len(),
            results = ranked.len(),
            query_techniques = query_techniques.len(),
            query_iocs = query_iocs.len(),
            "retrieval complete"
        );

        Ok(ranked)
    }
}

/// Apply entity-overlap boosts, sort, and collapse near-duplicates.
fn rerank(
    mut candidates: Vec<RetrievedChunk>,
    query_techniques: &BTreeSet<String>,
    query_iocs: &BTreeSet<(IocType, String)>,
    params: &RetrievalConfig,
) -> Vec<RetrievedChunk> {
    for cand in &mut candidates {
        let technique_overlap = overlap_fraction(
            query_techniques,
            cand.techniques.iter().map(|a| a.technique_id.clone()),
        );
        let ioc_overlap = overlap_fraction(
            query_iocs,
            cand.iocs.iter().map(|i| (i.ioc_type, i.value.clone())),
        );
        cand.score = (cand.similarity
            + params.technique_boost * technique_overlap
            + params.ioc_boost * ioc_overlap)
            .min(1.0);
    }

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });

    let mut kept: Vec<RetrievedChunk> = Vec::with_capacity(candidates.len());
    for cand in candidates {
        let duplicate = kept
            .iter()
            .any(|existing| is_near_duplicate(existing, &cand, params.dedup_similarity));
        if !duplicate {
            kept.push(cand);
        }
    }

    kept
}

/// Fraction of the query's entities present on the chunk. Empty query set
/// means no boost at all.
fn overlap_fraction<T: Ord>(query_set: &BTreeSet<T>, chunk_items: impl Iterator<Item = T>) -> f64 {
    if query_set.is_empty() {
        return 0.0;
    }
    let chunk_set: BTreeSet<T> = chunk_items.collect();
    let shared = query_set.intersection(&chunk_set).count();
    shared as f64 / query_set.len() as f64
}

/// Two results cover the same content when their spans overlap in the same
/// document, or when their token sets are nearly identical.
fn is_near_duplicate(kept: &RetrievedChunk, cand: &RetrievedChunk, jaccard_threshold: f64) -> bool {
    if kept.chunk.document_id == cand.chunk.document_id
        && kept.chunk.span_start < cand.chunk.span_end
        && cand.chunk.span_start < kept.chunk.span_end
    {
        return true;
    }
    token_jaccard(&kept.chunk.text, &cand.chunk.text) >= jaccard_threshold
}

fn token_jaccard(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| -> BTreeSet<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect()
    };

    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    let shared = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    shared / union
}

/// CLI entry for `tscope search`.
pub async fn run_search(
    config: &Config,
    query: &str,
    technique: Option<String>,
    ioc_type: Option<IocType>,
    limit: Option<usize>,
    min_score: Option<f64>,
) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    let retriever = Retriever::from_config(config, pool.clone())?;

    let filter = QueryFilter {
        technique_ids: technique.into_iter().collect(),
        ioc_types: ioc_type.into_iter().collect(),
        min_score,
    };
    let k = limit.unwrap_or(config.retrieval.final_k);

    let results = retriever.retrieve(query, k, &filter).await?;

    if results.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] chunk {} (similarity {:.3})",
            i + 1,
            result.score,
            result.chunk.id,
            result.similarity
        );
        println!(
            "    document: {}  span: {}..{}",
            result.chunk.document_id, result.chunk.span_start, result.chunk.span_end
        );
        if !result.techniques.is_empty() {
            let ids: Vec<&str> = result
                .techniques
                .iter()
                .map(|t| t.technique_id.as_str())
                .collect();
            println!("    techniques: {}", ids.join(", "));
        }
        if !result.iocs.is_empty() {
            let values: Vec<String> = result
                .iocs
                .iter()
                .map(|ioc| format!("{} {}", ioc.ioc_type, ioc.value))
                .collect();
            println!("    iocs: {}", values.join(", "));
        }
        let excerpt: String = result.chunk.text.chars().take(160).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " "));
        println!();
    }

    pool.close().await;
    Ok(())
}
