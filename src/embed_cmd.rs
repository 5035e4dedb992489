//! Embedding backfill commands.
//!
//! `embed pending` finds chunks with missing or stale vectors and fills
//! them in; `embed rebuild` clears the index and re-embeds everything.
//! Provider failures skip the batch; storage failures abort the command.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::index::VectorIndex;
use crate::models::EmbeddingRecord;

/// Find and embed chunks that are missing or have stale embeddings.
pub async fn run_embed_pending(
    config: &Config,
    limit: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("embedding provider is disabled; set [embedding] provider in config");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let model_name = provider.model_name().to_string();
    let pool = db::connect(config).await?;
    let index = VectorIndex::new(pool.clone());

    let pending = find_pending_chunks(&pool, &model_name, limit).await?;

    if dry_run {
        println!("embed pending (dry-run)");
        println!("  chunks needing embeddings: {}", pending.len());
        pool.close().await;
        return Ok(());
    }

    if pending.is_empty() {
        println!("embed pending");
        println!("  all chunks up to date");
        pool.close().await;
        return Ok(());
    }

    let (embedded, failed) =
        embed_batches(&index, provider.as_ref(), &pending, config.embedding.batch_size).await?;

    println!("embed pending");
    println!("  total pending: {}", pending.len());
    println!("  embedded: {}", embedded);
    println!("  failed: {}", failed);

    pool.close().await;
    Ok(())
}

/// Delete all stored vectors and regenerate with the configured provider.
/// This is the recovery path after switching embedding models.
pub async fn run_embed_rebuild(config: &Config) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("embedding provider is disabled; set [embedding] provider in config");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let model_name = provider.model_name().to_string();
    let pool = db::connect(config).await?;
    let index = VectorIndex::new(pool.clone());

    sqlx::query("DELETE FROM embeddings").execute(&pool).await?;
    println!("embed rebuild: cleared existing embeddings");

    let all_chunks = find_pending_chunks(&pool, &model_name, None).await?;

    if all_chunks.is_empty() {
        println!("  no chunks to embed");
        pool.close().await;
        return Ok(());
    }

    let (embedded, failed) = embed_batches(
        &index,
        provider.as_ref(),
        &all_chunks,
        config.embedding.batch_size,
    )
    .await?;

    println!("embed rebuild");
    println!("  total chunks: {}", all_chunks.len());
    println!("  embedded: {}", embedded);
    println!("  failed: {}", failed);

    pool.close().await;
    Ok(())
}

/// Embed pending chunks batch by batch. Provider errors skip the batch
/// (counted as failed); index errors propagate.
async fn embed_batches(
    index: &VectorIndex,
    provider: &dyn embedding::EmbeddingProvider,
    pending: &[PendingChunk],
    batch_size: usize,
) -> Result<(u64, u64)> {
    let mut embedded = 0u64;
    let mut failed = 0u64;

    for batch in pending.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();

        match provider.embed(&texts).await {
            Ok(vectors) => {
                let records: Vec<EmbeddingRecord> = batch
                    .iter()
                    .zip(vectors)
                    .map(|(item, vector)| EmbeddingRecord {
                        chunk_id: item.chunk_id.clone(),
                        document_id: item.document_id.clone(),
                        model: provider.model_name().to_string(),
                        dims: provider.dims(),
                        vector,
                        hash: item.hash.clone(),
                    })
                    .collect();
                index.upsert_batch(&records).await?;
                embedded += records.len() as u64;
            }
            Err(e) => {
                warn!(error = %e, batch = batch.len(), "embedding batch failed");
                failed += batch.len() as u64;
            }
        }
    }

    Ok((embedded, failed))
}

struct PendingChunk {
    chunk_id: String,
    document_id: String,
    text: String,
    hash: String,
}

/// Chunks that either have no vector for this model or whose text hash
/// no longer matches the stored one.
async fn find_pending_chunks(
    pool: &SqlitePool,
    model: &str,
    limit: Option<usize>,
) -> Result<Vec<PendingChunk>> {
    let limit_val = limit.unwrap_or(usize::MAX / 2) as i64;

    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, c.document_id, c.text, c.hash
        FROM chunks c
        LEFT JOIN embeddings e ON e.chunk_id = c.id AND e.model = ?
        WHERE e.chunk_id IS NULL OR e.hash != c.hash
        ORDER BY c.document_id, c.ordinal
        LIMIT ?
        "#,
    )
    .bind(model)
    .bind(limit_val)
    .fetch_all(pool)
    .await?;

    let results = rows
        .iter()
        .map(|row| PendingChunk {
            chunk_id: row.get("chunk_id"),
            document_id: row.get("document_id"),
            text: row.get("text"),
            hash: row.get("hash"),
        })
        .collect();

    Ok(results)
}
