//! Overlapping, boundary-preferring text chunker.
//!
//! Splits normalized report text into [`Chunk`]s of at most
//! `max_chunk_chars` bytes. Within a tolerance window at the end of each
//! chunk a paragraph break is preferred over a sentence break, and a
//! sentence break over a hard cut. Consecutive chunks overlap by
//! `overlap_chars` so that context spanning a cut survives in at least one
//! chunk. Identical input and configuration always produce identical
//! boundaries.
//!
//! Each chunk records its span in the source text plus a SHA-256 hash of its
//! text for embedding staleness detection.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::error::{Result, ThreatScopeError};
use crate::models::Chunk;

/// Fraction of the chunk size searched backwards for a natural boundary.
const BOUNDARY_TOLERANCE_DIVISOR: usize = 5;

/// Split text into overlapping chunks. Returns chunks with contiguous
/// ordinals starting at 0; whitespace-only input yields no chunks.
pub fn chunk_text(document_id: &str, text: &str, config: &ChunkingConfig) -> Result<Vec<Chunk>> {
    if config.overlap_chars == 0 || config.max_chunk_chars <= config.overlap_chars {
        return Err(ThreatScopeError::Config(format!(
            "chunking requires max_chunk_chars > overlap_chars > 0 (got max={}, overlap={})",
            config.max_chunk_chars, config.overlap_chars
        )));
    }

    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let max = config.max_chunk_chars;
    let overlap = config.overlap_chars;
    let n = text.len();

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut prev_end = 0usize;
    let mut ordinal: i64 = 0;

    loop {
        if n - start <= max {
            chunks.push(make_chunk(document_id, ordinal, text, start, n, prev_end));
            break;
        }

        let mut hard_end = floor_char_boundary(text, start + max);
        if hard_end <= start {
            // Only possible when max is smaller than one multibyte char.
            hard_end = (start + max).min(n);
            while !text.is_char_boundary(hard_end) {
                hard_end += 1;
            }
        }
        let end = natural_boundary(text, start, hard_end);
        chunks.push(make_chunk(document_id, ordinal, text, start, end, prev_end));
        prev_end = end;
        ordinal += 1;

        let next = floor_char_boundary(text, end.saturating_sub(overlap));
        // Guarantee forward progress even when the overlap would swallow the
        // whole previous window.
        start = if next > start { next } else { end };
    }

    Ok(chunks)
}

/// Scan the tail of the window for the best cut point: paragraph break,
/// then sentence end, then line break, else the hard limit.
fn natural_boundary(text: &str, start: usize, hard_end: usize) -> usize {
    let window = hard_end - start;
    let tolerance = (window / BOUNDARY_TOLERANCE_DIVISOR).max(1);
    let scan_from = floor_char_boundary(text, hard_end - tolerance.min(window.saturating_sub(1)));
    let tail = &text[scan_from..hard_end];

    if let Some(pos) = tail.rfind("\n\n") {
        return scan_from + pos + 2;
    }
    let sentence_cut = [". ", "! ", "? "]
        .iter()
        .filter_map(|sep| tail.rfind(sep))
        .max();
    if let Some(pos) = sentence_cut {
        return scan_from + pos + 2;
    }
    if let Some(pos) = tail.rfind('\n') {
        return scan_from + pos + 1;
    }
    hard_end
}

fn make_chunk(
    document_id: &str,
    ordinal: i64,
    text: &str,
    start: usize,
    end: usize,
    prev_end: usize,
) -> Chunk {
    let slice = &text[start..end];
    let mut hasher = Sha256::new();
    hasher.update(slice.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        ordinal,
        text: slice.to_string(),
        span_start: start as i64,
        span_end: end as i64,
        overlap_with_prev: ordinal > 0 && start < prev_end,
        hash,
    }
}

pub(crate) fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
