//! Flattens OCR output into ordered text lines.
//!
//! Pure functions, no async.

use crate::ocr::{OcrDocument, OcrLine};

/// All lines of the document: regions in result order, lines in detection order.
pub fn extract_lines(doc: &OcrDocument) -> Vec<OcrLine> {
    doc.regions
        .iter()
        .flat_map(|region| region.lines.iter().cloned())
        .collect()
}

/// Texts worth sending to entity recognition (drops empty and whitespace-only lines).
pub fn recognizable_texts(lines: &[OcrLine]) -> Vec<String> {
    lines
        .iter()
        .filter(|line| !is_blank(&line.text))
        .map(|line| line.text.clone())
        .collect()
}

pub fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}
