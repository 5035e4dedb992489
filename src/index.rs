//! Vector index over chunk embeddings.
//!
//! Embeddings live in the `embeddings` table keyed by `(chunk_id, model)`.
//! Queries pre-filter by technique annotation and indicator type in SQL,
//! then score the surviving candidates by cosine similarity in Rust.
//! Negative cosine clamps to zero, so scores are always in `[0, 1]`.
//!
//! Dimensionality is enforced at both ends: writes reject records whose
//! vector length disagrees with their declared dims or with what the model
//! already has stored, and queries reject vectors that do not match the
//! stored dims. Querying an index with no rows for the model returns an
//! empty result, not an error.

use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Result, ThreatScopeError};
use crate::models::{EmbeddingRecord, IocType};

#[derive(Clone)]
pub struct VectorIndex {
    pool: SqlitePool,
}

/// Metadata constraints applied before ranking.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Keep only chunks annotated with at least one of these techniques.
    pub technique_ids: Vec<String>,
    /// Keep only chunks sighting at least one indicator of these types.
    pub ioc_types: Vec<IocType>,
    /// Drop hits scoring below this floor.
    pub min_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f64,
}

impl VectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The model and dims currently stored, if any rows exist.
    pub async fn stored_model(&self) -> Result<Option<(String, usize)>> {
        let row = sqlx::query("SELECT model, dims FROM embeddings LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| {
            let dims: i64 = r.get("dims");
            (r.get("model"), dims as usize)
        }))
    }

    pub async fn count(&self, model: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE model = ?")
                .bind(model)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    /// Write a batch of embeddings in one transaction. Any dims violation
    /// fails the whole batch before a row is written.
    pub async fn upsert_batch(&self, records: &[EmbeddingRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        for rec in records {
            if rec.vector.len() != rec.dims {
                return Err(ThreatScopeError::DimensionMismatch {
                    expected: rec.dims,
                    actual: rec.vector.len(),
                });
            }
            let stored: Option<i64> =
                sqlx::query_scalar("SELECT dims FROM embeddings WHERE model = ? LIMIT 1")
                    .bind(&rec.model)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some(stored_dims) = stored {
                if stored_dims as usize != rec.dims {
                    return Err(ThreatScopeError::DimensionMismatch {
                        expected: stored_dims as usize,
                        actual: rec.dims,
                    });
                }
            }
        }

        let mut tx = self.pool.begin().await?;
        for rec in records {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO embeddings (chunk_id, document_id, model, dims, hash, vector)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&rec.chunk_id)
            .bind(&rec.document_id)
            .bind(&rec.model)
            .bind(rec.dims as i64)
            .bind(&rec.hash)
            .bind(vec_to_blob(&rec.vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// Rank the filtered candidates against a query vector, best first.
    /// Ties break on chunk id for a stable order.
    pub async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &QueryFilter,
        model: &str,
    ) -> Result<Vec<VectorHit>> {
        let stored: Option<i64> =
            sqlx::query_scalar("SELECT dims FROM embeddings WHERE model = ? LIMIT 1")
                .bind(model)
                .fetch_optional(&self.pool)
                .await?;

        let Some(stored_dims) = stored else {
            return Ok(Vec::new());
        };
        if stored_dims as usize != vector.len() {
            return Err(ThreatScopeError::DimensionMismatch {
                expected: stored_dims as usize,
                actual: vector.len(),
            });
        }

        // Metadata filters run in SQL so losers never reach the scorer.
        let mut sql = String::from(
            "SELECT e.chunk_id, e.document_id, e.vector FROM embeddings e WHERE e.model = ?",
        );
        if !filter.technique_ids.is_empty() {
            let placeholders = vec!["?"; filter.technique_ids.len()].join(", ");
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM technique_annotations ta WHERE ta.chunk_id = e.chunk_id AND ta.technique_id IN ({}))",
                placeholders
            ));
        }
        if !filter.ioc_types.is_empty() {
            let placeholders = vec!["?"; filter.ioc_types.len()].join(", ");
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM ioc_chunks ic JOIN iocs i ON i.id = ic.ioc_id WHERE ic.chunk_id = e.chunk_id AND i.ioc_type IN ({}))",
                placeholders
            ));
        }

        let mut query = sqlx::query(&sql).bind(model);
        for technique_id in &filter.technique_ids {
            query = query.bind(technique_id);
        }
        for ioc_type in &filter.ioc_types {
            query = query.bind(ioc_type.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("vector");
            let stored_vec = blob_to_vec(&blob);
            let sim = cosine_similarity(vector, &stored_vec);
            let score = f64::from(sim).max(0.0);
            if let Some(floor) = filter.min_score {
                if score < floor {
                    continue;
                }
            }
            hits.push(VectorHit {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                score,
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);

        Ok(hits)
    }

    /// Remove every embedding for a document. Returns rows removed.
    pub async fn delete_document(&self, document_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM embeddings WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
