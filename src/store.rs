//! SQLite persistence for documents, chunks, annotations, and indicators.
//!
//! All per-document writes go through [`Store::upsert_document_bundle`],
//! which replaces a document's rows in one transaction: either the whole
//! new version lands or none of it does. Indicators are global rows
//! deduplicated by `(type, value)`; documents hold sightings in the
//! `ioc_chunks` join table, and an indicator row is removed only when its
//! last sighting goes away.

use std::collections::BTreeMap;
use std::str::FromStr;

use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{Result, ThreatScopeError};
use crate::models::{
    Chunk, DocFormat, Document, EmbeddingRecord, Ioc, IocType, TechniqueAnnotation,
};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Look up a document by source URI. Returns `(id, dedup_hash)` so the
    /// ingest path can keep ids stable across re-ingests and skip unchanged
    /// content.
    pub async fn find_document_by_uri(&self, source_uri: &str) -> Result<Option<(String, String)>> {
        let row = sqlx::query("SELECT id, dedup_hash FROM documents WHERE source_uri = ?")
            .bind(source_uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| (r.get("id"), r.get("dedup_hash"))))
    }

    /// Replace a document and everything derived from it in one transaction.
    ///
    /// Existing rows for the same document id are deleted first, indicator
    /// sightings included. Indicators themselves are merged into the global
    /// table: an existing `(type, value)` row keeps its id, takes the max
    /// confidence, and takes new enrichment when present.
    pub async fn upsert_document_bundle(
        &self,
        doc: &Document,
        chunks: &[Chunk],
        annotations: &[TechniqueAnnotation],
        iocs: &[Ioc],
        records: &[EmbeddingRecord],
    ) -> Result<()> {
        for rec in records {
            if rec.vector.len() != rec.dims {
                return Err(ThreatScopeError::DimensionMismatch {
                    expected: rec.dims,
                    actual: rec.vector.len(),
                });
            }
        }

        let mut tx = self.pool.begin().await?;

        // Delete old rows for this document
        sqlx::query("DELETE FROM embeddings WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM ioc_chunks WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM technique_annotations WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, source_uri, title, format, body, dedup_hash, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.source_uri)
        .bind(&doc.title)
        .bind(doc.format.as_str())
        .bind(&doc.body)
        .bind(&doc.dedup_hash)
        .bind(doc.ingested_at)
        .execute(&mut *tx)
        .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, ordinal, text, span_start, span_end, overlap_with_prev, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.ordinal)
            .bind(&chunk.text)
            .bind(chunk.span_start)
            .bind(chunk.span_end)
            .bind(chunk.overlap_with_prev)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;
        }

        for ann in annotations {
            let terms = serde_json::to_string(&ann.matched_terms)
                .unwrap_or_else(|_| "[]".to_string());
            sqlx::query(
                r#"
                INSERT INTO technique_annotations (chunk_id, document_id, technique_id, technique_name, confidence, matched_terms)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&ann.chunk_id)
            .bind(&doc.id)
            .bind(&ann.technique_id)
            .bind(&ann.technique_name)
            .bind(ann.confidence)
            .bind(terms)
            .execute(&mut *tx)
            .await?;
        }

        for ioc in iocs {
            let existing_id: Option<String> =
                sqlx::query_scalar("SELECT id FROM iocs WHERE ioc_type = ? AND value = ?")
                    .bind(ioc.ioc_type.as_str())
                    .bind(&ioc.value)
                    .fetch_optional(&mut *tx)
                    .await?;

            let enrichment = match &ioc.enrichment {
                Some(map) => Some(
                    serde_json::to_string(map).unwrap_or_else(|_| "{}".to_string()),
                ),
                None => None,
            };

            let ioc_id = match existing_id {
                Some(id) => {
                    sqlx::query(
                        "UPDATE iocs SET confidence = MAX(confidence, ?), enrichment = COALESCE(?, enrichment) WHERE id = ?",
                    )
                    .bind(ioc.confidence)
                    .bind(&enrichment)
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
                    id
                }
                None => {
                    sqlx::query(
                        "INSERT INTO iocs (id, ioc_type, value, confidence, enrichment) VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(&ioc.id)
                    .bind(ioc.ioc_type.as_str())
                    .bind(&ioc.value)
                    .bind(ioc.confidence)
                    .bind(&enrichment)
                    .execute(&mut *tx)
                    .await?;
                    ioc.id.clone()
                }
            };

            for chunk_id in &ioc.chunk_ids {
                sqlx::query(
                    "INSERT OR IGNORE INTO ioc_chunks (ioc_id, chunk_id, document_id) VALUES (?, ?, ?)",
                )
                .bind(&ioc_id)
                .bind(chunk_id)
                .bind(&doc.id)
                .execute(&mut *tx)
                .await?;
            }
        }

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
            .bind(crate::embedding::vec_to_blob(&rec.vector))
            .execute(&mut *tx)
            .await?;
        }

        // Drop indicator rows whose last sighting was just replaced away
        sqlx::query("DELETE FROM iocs WHERE id NOT IN (SELECT DISTINCT ioc_id FROM ioc_chunks)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            document_id = %doc.id,
            chunks = chunks.len(),
            annotations = annotations.len(),
            iocs = iocs.len(),
            embeddings = records.len(),
            "document bundle stored"
        );

        Ok(())
    }

    /// Delete a document and everything derived from it. Indicator rows
    /// sighted only in this document go too; shared ones survive. Returns
    /// whether the document existed.
    pub async fn delete_document(&self, document_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM embeddings WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM ioc_chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM iocs WHERE id NOT IN (SELECT DISTINCT ioc_id FROM ioc_chunks)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM technique_annotations WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, source_uri, title, format, body, dedup_hash, ingested_at FROM documents WHERE id = ?",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_document).transpose()
    }

    pub async fn get_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, ordinal, text, span_start, span_end, overlap_with_prev, hash FROM chunks WHERE document_id = ? ORDER BY ordinal",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_chunk).collect())
    }

    pub async fn get_chunk(&self, chunk_id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query(
            "SELECT id, document_id, ordinal, text, span_start, span_end, overlap_with_prev, hash FROM chunks WHERE id = ?",
        )
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_chunk))
    }

    pub async fn annotations_for_chunk(&self, chunk_id: &str) -> Result<Vec<TechniqueAnnotation>> {
        let rows = sqlx::query(
            "SELECT chunk_id, technique_id, technique_name, confidence, matched_terms FROM technique_annotations WHERE chunk_id = ? ORDER BY confidence DESC, technique_id",
        )
        .bind(chunk_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| TechniqueAnnotation {
                chunk_id: r.get("chunk_id"),
                technique_id: r.get("technique_id"),
                technique_name: r.get("technique_name"),
                confidence: r.get("confidence"),
                matched_terms: serde_json::from_str(r.get::<String, _>("matched_terms").as_str())
                    .unwrap_or_default(),
            })
            .collect())
    }

    pub async fn iocs_for_chunk(&self, chunk_id: &str) -> Result<Vec<Ioc>> {
        let rows = sqlx::query(
            r#"
            SELECT i.id, i.ioc_type, i.value, i.confidence, i.enrichment
            FROM iocs i
            JOIN ioc_chunks ic ON ic.ioc_id = i.id
            WHERE ic.chunk_id = ?
            ORDER BY i.ioc_type, i.value
            "#,
        )
        .bind(chunk_id)
        .fetch_all(&self.pool)
        .await?;

        let mut iocs = Vec::with_capacity(rows.len());
        for row in rows {
            iocs.push(self.hydrate_ioc(row).await?);
        }
        Ok(iocs)
    }

    pub async fn list_iocs(&self, ioc_type: Option<IocType>) -> Result<Vec<Ioc>> {
        let rows = match ioc_type {
            Some(t) => {
                sqlx::query(
                    "SELECT id, ioc_type, value, confidence, enrichment FROM iocs WHERE ioc_type = ? ORDER BY ioc_type, value",
                )
                .bind(t.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, ioc_type, value, confidence, enrichment FROM iocs ORDER BY ioc_type, value",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut iocs = Vec::with_capacity(rows.len());
        for row in rows {
            iocs.push(self.hydrate_ioc(row).await?);
        }
        Ok(iocs)
    }

    async fn hydrate_ioc(&self, row: sqlx::sqlite::SqliteRow) -> Result<Ioc> {
        let type_str: String = row.get("ioc_type");
        let ioc_type = IocType::from_str(&type_str).map_err(|_| {
            ThreatScopeError::CorruptInput(format!("stored ioc type '{}'", type_str))
        })?;

        let enrichment: Option<String> = row.get("enrichment");
        let enrichment: Option<BTreeMap<String, String>> =
            enrichment.and_then(|s| serde_json::from_str(&s).ok());

        let id: String = row.get("id");
        let chunk_ids: Vec<String> =
            sqlx::query_scalar("SELECT chunk_id FROM ioc_chunks WHERE ioc_id = ? ORDER BY chunk_id")
                .bind(&id)
                .fetch_all(&self.pool)
                .await?;

        Ok(Ioc {
            id,
            ioc_type,
            value: row.get("value"),
            confidence: row.get("confidence"),
            enrichment,
            chunk_ids: chunk_ids.into_iter().collect(),
        })
    }

    /// Annotation counts per technique across the whole corpus, most
    /// frequent first.
    pub async fn list_technique_counts(&self) -> Result<Vec<(String, String, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT technique_id, technique_name, COUNT(*) AS n
            FROM technique_annotations
            GROUP BY technique_id, technique_name
            ORDER BY n DESC, technique_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get("technique_id"), r.get("technique_name"), r.get("n")))
            .collect())
    }

    pub async fn count_documents(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn count_chunks(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?)
    }
}

fn row_to_document(row: sqlx::sqlite::SqliteRow) -> Result<Document> {
    let format_str: String = row.get("format");
    let format = DocFormat::from_name(&format_str).ok_or_else(|| {
        ThreatScopeError::CorruptInput(format!("stored document format '{}'", format_str))
    })?;

    Ok(Document {
        id: row.get("id"),
        source_uri: row.get("source_uri"),
        title: row.get("title"),
        format,
        body: row.get("body"),
        dedup_hash: row.get("dedup_hash"),
        ingested_at: row.get("ingested_at"),
    })
}

fn row_to_chunk(row: sqlx::sqlite::SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        ordinal: row.get("ordinal"),
        text: row.get("text"),
        span_start: row.get("span_start"),
        span_end: row.get("span_end"),
        overlap_with_prev: row.get("overlap_with_prev"),
        hash: row.get("hash"),
    }
}
