//! Inspection and maintenance commands.
//!
//! `get` prints a document with its chunks and per-chunk annotations,
//! `delete` removes a document and everything derived from it, `iocs`
//! and `techniques` summarize what the corpus has accumulated.

use anyhow::Result;

use crate::catalog::load_catalog;
use crate::config::Config;
use crate::db;
use crate::models::IocType;
use crate::store::Store;

/// Print a document with its metadata, body, and annotated chunks.
pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = Store::new(pool.clone());

    let doc = match store.get_document(id).await? {
        Some(doc) => doc,
        None => {
            pool.close().await;
            eprintln!("Error: document not found: {}", id);
            std::process::exit(1);
        }
    };

    println!("--- Document ---");
    println!("id:          {}", doc.id);
    println!(
        "title:       {}",
        doc.title.as_deref().unwrap_or("(untitled)")
    );
    println!("source_uri:  {}", doc.source_uri);
    println!("format:      {}", doc.format.as_str());
    println!("ingested_at: {}", format_ts_iso(doc.ingested_at));
    println!();

    println!("--- Body ---");
    println!("{}", doc.body);
    println!();

    let chunks = store.get_chunks(&doc.id).await?;
    println!("--- Chunks ({}) ---", chunks.len());
    for chunk in &chunks {
        println!(
            "[chunk {}] {} (bytes {}..{}{})",
            chunk.ordinal,
            chunk.id,
            chunk.span_start,
            chunk.span_end,
            if chunk.overlap_with_prev {
                ", overlaps previous"
            } else {
                ""
            }
        );

        let annotations = store.annotations_for_chunk(&chunk.id).await?;
        for ann in &annotations {
            println!(
                "  technique: {} {} ({:.2}) [{}]",
                ann.technique_id,
                ann.technique_name,
                ann.confidence,
                ann.matched_terms.join(", ")
            );
        }
        let iocs = store.iocs_for_chunk(&chunk.id).await?;
        for ioc in &iocs {
            println!(
                "  ioc: {} {} ({:.2})",
                ioc.ioc_type.as_str(),
                ioc.value,
                ioc.confidence
            );
        }

        println!("{}", chunk.text);
        println!();
    }

    pool.close().await;
    Ok(())
}

/// Delete a document, its chunks, annotations, IOC sightings, and vectors.
/// Indicators still sighted by other documents survive.
pub async fn run_delete(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = Store::new(pool.clone());

    let deleted = store.delete_document(id).await?;
    if deleted {
        println!("deleted document {}", id);
    } else {
        eprintln!("Error: document not found: {}", id);
        pool.close().await;
        std::process::exit(1);
    }

    pool.close().await;
    Ok(())
}

/// List stored indicators, optionally filtered by type.
pub async fn run_iocs(config: &Config, ioc_type: Option<IocType>) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = Store::new(pool.clone());

    let iocs = store.list_iocs(ioc_type).await?;
    if iocs.is_empty() {
        println!("No indicators stored.");
        pool.close().await;
        return Ok(());
    }

    println!(
        "  {:<8} {:<44} {:>6} {:>7}   {}",
        "TYPE", "VALUE", "CONF", "CHUNKS", "ENRICHMENT"
    );
    println!("  {}", "-".repeat(88));
    for ioc in &iocs {
        let enrichment = match &ioc.enrichment {
            Some(map) => map
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(" "),
            None => String::new(),
        };
        println!(
            "  {:<8} {:<44} {:>6.2} {:>7}   {}",
            ioc.ioc_type.as_str(),
            truncate_value(&ioc.value, 44),
            ioc.confidence,
            ioc.chunk_ids.len(),
            enrichment
        );
    }

    pool.close().await;
    Ok(())
}

/// List catalog techniques with how often each is seen in the corpus.
pub async fn run_techniques(config: &Config) -> Result<()> {
    let catalog = load_catalog(&config.catalog.path)?;
    let pool = db::connect(config).await?;
    let store = Store::new(pool.clone());

    let counts = store.list_technique_counts().await?;

    println!(
        "  {:<12} {:<36} {:<20} {:>6}",
        "ID", "NAME", "TACTIC", "SEEN"
    );
    println!("  {}", "-".repeat(78));
    for entry in &catalog.techniques {
        let seen = counts
            .iter()
            .find(|(id, _, _)| id == &entry.id)
            .map(|(_, _, n)| *n)
            .unwrap_or(0);
        println!(
            "  {:<12} {:<36} {:<20} {:>6}",
            entry.id,
            entry.name,
            entry.tactic.as_deref().unwrap_or(""),
            seen
        );
    }

    // Annotations whose technique no longer exists in the catalog file.
    for (id, name, n) in &counts {
        if catalog.get(id).is_none() {
            println!("  {:<12} {:<36} {:<20} {:>6}  (not in catalog)", id, name, "", n);
        }
    }

    pool.close().await;
    Ok(())
}

fn truncate_value(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        value.to_string()
    } else {
        let cut: String = value.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
