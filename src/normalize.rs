//! Raw-bytes to canonical-text normalization.
//!
//! Every format converges on one representation: UTF-8 text with `\n` line
//! endings plus a monotonic [`OffsetMap`] from output positions back to the
//! original byte offset (txt/log) or page number (pdf). Normalization is a
//! pure function of its inputs.

use std::path::Path;

use crate::error::{Result, ThreatScopeError};
use crate::models::DocFormat;

/// What the source side of an [`OffsetMap`] counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceUnit {
    Byte,
    Page,
}

/// Monotonic map from output byte positions to source positions.
///
/// Stored as `(output_start, source_start)` anchor pairs. Between anchors in
/// byte mode the mapping advances one-to-one; in page mode every position up
/// to the next anchor belongs to the anchor's page.
#[derive(Debug, Clone)]
pub struct OffsetMap {
    unit: SourceUnit,
    anchors: Vec<(usize, u64)>,
}

impl OffsetMap {
    fn new(unit: SourceUnit) -> Self {
        Self {
            unit,
            anchors: vec![(0, 0)],
        }
    }

    fn anchor(&mut self, out_pos: usize, src_pos: u64) {
        // Replace rather than duplicate when re-anchoring the same position.
        if let Some(last) = self.anchors.last_mut() {
            if last.0 == out_pos {
                last.1 = src_pos;
                return;
            }
        }
        self.anchors.push((out_pos, src_pos));
    }

    pub fn unit(&self) -> SourceUnit {
        self.unit
    }

    /// Resolve an output position to its source byte offset or page number.
    pub fn source_of(&self, out_pos: usize) -> u64 {
        let idx = match self.anchors.binary_search_by(|(o, _)| o.cmp(&out_pos)) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        let (anchor_out, anchor_src) = self.anchors[idx];
        match self.unit {
            SourceUnit::Byte => anchor_src + (out_pos - anchor_out) as u64,
            SourceUnit::Page => anchor_src,
        }
    }
}

/// Canonical text plus its provenance map.
#[derive(Debug, Clone)]
pub struct NormalizedDoc {
    pub text: String,
    pub offsets: OffsetMap,
}

/// Classify a file, by extension first and `%PDF-` magic as a fallback.
pub fn detect_format(path: &Path, bytes: &[u8]) -> Result<DocFormat> {
    if let Some(format) = DocFormat::from_path(path) {
        return Ok(format);
    }
    if bytes.starts_with(b"%PDF-") {
        return Ok(DocFormat::Pdf);
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("(none)");
    Err(ThreatScopeError::UnsupportedFormat(format!(
        "{}: extension '{}' is not pdf, txt, or log",
        path.display(),
        ext
    )))
}

/// Normalize raw bytes of the given format into canonical text.
pub fn normalize(bytes: &[u8], format: DocFormat) -> Result<NormalizedDoc> {
    match format {
        DocFormat::Txt | DocFormat::Log => Ok(normalize_text(bytes)),
        DocFormat::Pdf => normalize_pdf(bytes),
    }
}

/// Lenient UTF-8 decode with CRLF folding.
///
/// Invalid sequences become U+FFFD; `\r\n` folds to `\n`; a lone `\r` is
/// rewritten to `\n`. The offset map gains an anchor at every point where
/// output and source byte positions diverge.
fn normalize_text(bytes: &[u8]) -> NormalizedDoc {
    let mut text = String::with_capacity(bytes.len());
    let mut map = OffsetMap::new(SourceUnit::Byte);
    let mut src = 0usize;

    while src < bytes.len() {
        match std::str::from_utf8(&bytes[src..]) {
            Ok(valid) => {
                copy_folding_newlines(valid, src, &mut text, &mut map);
                src = bytes.len();
            }
            Err(e) => {
                let valid_len = e.valid_up_to();
                let valid = std::str::from_utf8(&bytes[src..src + valid_len]).unwrap_or_default();
                copy_folding_newlines(valid, src, &mut text, &mut map);
                src += valid_len;
                // One replacement char per undecodable sequence.
                text.push('\u{FFFD}');
                src += e.error_len().unwrap_or(bytes.len() - src).max(1);
                map.anchor(text.len(), src as u64);
            }
        }
    }

    NormalizedDoc { text, offsets: map }
}

fn copy_folding_newlines(s: &str, src_base: usize, out: &mut String, map: &mut OffsetMap) {
    let mut chars = s.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\r' {
            if matches!(chars.peek(), Some((_, '\n'))) {
                // Drop the '\r'; the following '\n' realigns the map.
                map.anchor(out.len(), (src_base + i + 1) as u64);
            } else {
                // Lone '\r' becomes '\n'; same byte width, no divergence.
                out.push('\n');
            }
        } else {
            out.push(c);
        }
    }
}

/// Extract text from a PDF and map output positions to page numbers.
///
/// Pages are delimited by the form feeds the extractor emits; an extraction
/// failure or a document with no recoverable text is [`ThreatScopeError::CorruptInput`].
fn normalize_pdf(bytes: &[u8]) -> Result<NormalizedDoc> {
    let raw = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| ThreatScopeError::CorruptInput(format!("pdf extraction failed: {}", e)))?;

    let mut text = String::with_capacity(raw.len());
    let mut map = OffsetMap::new(SourceUnit::Page);
    let mut page: u64 = 0;
    let mut recovered = 0usize;

    for raw_page in raw.split('\u{c}') {
        page += 1;
        let page_text = raw_page.trim_matches(['\r', '\n']);
        if page_text.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        map.anchor(text.len(), page);
        let folded = normalize_text(page_text.as_bytes());
        text.push_str(&folded.text);
        recovered += 1;
    }

    if recovered == 0 {
        return Err(ThreatScopeError::CorruptInput(
            "pdf contains no extractable text".to_string(),
        ));
    }

    Ok(NormalizedDoc { text, offsets: map })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_identity() {
        let doc = normalize(b"alpha\nbeta\n", DocFormat::Txt).unwrap();
        assert_eq!(doc.text, "alpha\nbeta\n");
        assert_eq!(doc.offsets.source_of(0), 0);
        assert_eq!(doc.offsets.source_of(6), 6);
    }

    #[test]
    fn test_crlf_folded_with_offsets() {
        let doc = normalize(b"one\r\ntwo\r\nthree", DocFormat::Log).unwrap();
        assert_eq!(doc.text, "one\ntwo\nthree");
        // 't' of "two" sits at output 4 but source byte 5.
        assert_eq!(doc.offsets.source_of(4), 5);
        // 't' of "three" sits at output 8, source byte 10.
        assert_eq!(doc.offsets.source_of(8), 10);
    }

    #[test]
    fn test_lone_cr_becomes_newline() {
        let doc = normalize(b"a\rb", DocFormat::Txt).unwrap();
        assert_eq!(doc.text, "a\nb");
        assert_eq!(doc.offsets.source_of(2), 2);
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let doc = normalize(b"ok\xFF\xFEend", DocFormat::Txt).unwrap();
        assert!(doc.text.starts_with("ok"));
        assert!(doc.text.ends_with("end"));
        assert!(doc.text.contains('\u{FFFD}'));
        // The tail still maps back to its true source bytes.
        let end_out = doc.text.len() - 3;
        assert_eq!(doc.offsets.source_of(end_out), 4);
    }

    #[test]
    fn test_garbage_pdf_is_corrupt_input() {
        let err = normalize(b"definitely not a pdf", DocFormat::Pdf).unwrap_err();
        assert!(matches!(err, ThreatScopeError::CorruptInput(_)));
    }

    #[test]
    fn test_detect_format_extension_and_magic() {
        assert_eq!(
            detect_format(Path::new("r.txt"), b"hello").unwrap(),
            DocFormat::Txt
        );
        assert_eq!(
            detect_format(Path::new("blob"), b"%PDF-1.7 rest").unwrap(),
            DocFormat::Pdf
        );
        let err = detect_format(Path::new("r.docx"), b"PK\x03\x04").unwrap_err();
        assert!(matches!(err, ThreatScopeError::UnsupportedFormat(_)));
    }
}
