use crate::document::{RawDocument, TextSpan};
use crate::error::ExternalError;
use crate::external::TextExtractor;

/// Marker lopdf leaves behind for CID fonts it cannot decode.
const IDENTITY_H_PATTERN: &str = "?Identity-H Unimplemented?";

/// Lines shorter than this are trusted regardless of character composition.
const MIN_TOTAL_CHARS: usize = 50;

/// Minimum share of alphanumeric characters for a line to count as clean text.
const MIN_ALPHANUMERIC_PERCENT: usize = 10;

const NATIVE_TEXT_CONFIDENCE: f32 = 1.0;
const GARBLED_TEXT_CONFIDENCE: f32 = 0.2;

/// Native text extraction from the PDF content streams via `lopdf`.
///
/// Produces one span per non-empty line. No OCR is attempted; scanned plans
/// yield no spans and must be covered by the other extractors.
#[derive(Debug, Clone, Default)]
pub struct PdfTextExtractor;

impl PdfTextExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl TextExtractor for PdfTextExtractor {
    fn extract_text(&self, document: &RawDocument) -> Result<Vec<TextSpan>, ExternalError> {
        let _span = tracing::info_span!("extract.pdf_text").entered();

        let doc = lopdf::Document::load_mem(&document.bytes)
            .map_err(|e| ExternalError::Unsupported(format!("Failed to load PDF: {}", e)))?;

        if doc.is_encrypted() {
            return Err(ExternalError::Unsupported("PDF is encrypted".to_string()));
        }

        let mut spans = Vec::new();
        for (page_num, _) in doc.get_pages() {
            let page_text = match doc.extract_text(&[page_num]) {
                Ok(text) => text,
                Err(e) => {
                    tracing::debug!("No text on page {}: {}", page_num, e);
                    continue;
                }
            };

            let mut line_no = 0;
            for line in page_text.lines() {
                let cleaned = line.replace(IDENTITY_H_PATTERN, "");
                let cleaned = cleaned.trim();
                if cleaned.is_empty() {
                    continue;
                }
                line_no += 1;
                spans.push(TextSpan {
                    text: cleaned.to_string(),
                    page: page_num,
                    line: line_no,
                    confidence: line_confidence(cleaned),
                });
            }
        }

        Ok(spans)
    }
}

/// Confidence for a natively extracted line: garbled font output gets a low
/// score so other extractors win conflicts against it.
fn line_confidence(text: &str) -> f32 {
    if looks_garbled(text) {
        GARBLED_TEXT_CONFIDENCE
    } else {
        NATIVE_TEXT_CONFIDENCE
    }
}

fn looks_garbled(text: &str) -> bool {
    let total_chars = text.chars().count();
    let alphanumeric_chars = text.chars().filter(|c| c.is_alphanumeric()).count();

    total_chars > MIN_TOTAL_CHARS
        && alphanumeric_chars * 100 < total_chars * MIN_ALPHANUMERIC_PERCENT
}
