//! Raw artifacts produced by ingestion and the extractors.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Bytes of a source document plus its content hash.
#[derive(Clone)]
pub struct RawDocument {
    pub bytes: Arc<[u8]>,
    /// Lowercase hex SHA-256 of `bytes`.
    pub content_hash: String,
    pub mime_type: Option<String>,
}

impl RawDocument {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for RawDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDocument")
            .field("len", &self.bytes.len())
            .field("content_hash", &self.content_hash)
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

/// The extractor family that produced a raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    Text,
    Table,
    Layout,
    Entity,
}

impl ExtractorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractorKind::Text => "text",
            ExtractorKind::Table => "table",
            ExtractorKind::Layout => "layout",
            ExtractorKind::Entity => "entity",
        }
    }
}

impl fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextSpan {
    pub text: String,
    pub page: u32,
    pub line: u32,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCell {
    pub text: String,
    pub page: u32,
    pub row: u32,
    pub column: u32,
    /// Column header, when the table extractor detected one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutRegion {
    pub label: String,
    pub text: String,
    pub page: u32,
    /// `[x0, y0, x1, y1]` in page points.
    pub bbox: [f32; 4],
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NerSpan {
    pub label: String,
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub confidence: f32,
}

/// One raw value from any extractor. The set of variants is closed so that
/// rule matching stays exhaustive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawValue {
    TextSpan(TextSpan),
    TableCell(TableCell),
    LayoutRegion(LayoutRegion),
    NerSpan(NerSpan),
}

impl RawValue {
    pub fn extractor(&self) -> ExtractorKind {
        match self {
            RawValue::TextSpan(_) => ExtractorKind::Text,
            RawValue::TableCell(_) => ExtractorKind::Table,
            RawValue::LayoutRegion(_) => ExtractorKind::Layout,
            RawValue::NerSpan(_) => ExtractorKind::Entity,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            RawValue::TextSpan(span) => &span.text,
            RawValue::TableCell(cell) => &cell.text,
            RawValue::LayoutRegion(region) => &region.text,
            RawValue::NerSpan(span) => &span.text,
        }
    }

    /// Label used by rule matching: NER label, layout label or table header.
    pub fn label(&self) -> Option<&str> {
        match self {
            RawValue::TextSpan(_) => None,
            RawValue::TableCell(cell) => cell.header.as_deref(),
            RawValue::LayoutRegion(region) => Some(&region.label),
            RawValue::NerSpan(span) => Some(&span.label),
        }
    }

    pub fn confidence(&self) -> f32 {
        match self {
            RawValue::TextSpan(span) => span.confidence,
            RawValue::TableCell(cell) => cell.confidence,
            RawValue::LayoutRegion(region) => region.confidence,
            RawValue::NerSpan(span) => span.confidence,
        }
    }
}

/// Which extractor produced a value, how confident it was, and where it sits
/// in the document's extraction order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub extractor: ExtractorKind,
    pub confidence: f32,
    /// Position in extraction order; higher means extracted later.
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedItem {
    pub value: RawValue,
    pub provenance: Provenance,
}

impl ExtractedItem {
    pub fn new(value: RawValue, sequence: u64) -> Self {
        let provenance = Provenance {
            extractor: value.extractor(),
            confidence: value.confidence().clamp(0.0, 1.0),
            sequence,
        };
        Self { value, provenance }
    }
}

/// Everything the extraction stage produced for one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionArtifact {
    pub items: Vec<ExtractedItem>,
}

impl ExtractionArtifact {
    /// Builds the artifact from the four extractor outputs, numbering items in
    /// the order text, tables, layout, entities.
    pub fn assemble(
        text: Vec<TextSpan>,
        tables: Vec<TableCell>,
        layout: Vec<LayoutRegion>,
        entities: Vec<NerSpan>,
    ) -> Self {
        let values = text
            .into_iter()
            .map(RawValue::TextSpan)
            .chain(tables.into_iter().map(RawValue::TableCell))
            .chain(layout.into_iter().map(RawValue::LayoutRegion))
            .chain(entities.into_iter().map(RawValue::NerSpan));

        let items = values
            .enumerate()
            .map(|(index, value)| ExtractedItem::new(value, index as u64))
            .collect();

        Self { items }
    }

    pub fn count(&self, kind: ExtractorKind) -> usize {
        self.items
            .iter()
            .filter(|item| item.provenance.extractor == kind)
            .count()
    }
}
