//! Contracts for the external collaborators the pipeline drives, plus the
//! default adapters used by the command-line front end.
//!
//! Every collaborator is a black box: typed input in, typed output or an
//! [`ExternalError`] out. Implementations must not mutate shared state; the
//! stage runner applies their output to the document record.

pub mod ingest;
pub mod pdf;
pub mod sink;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::document::{
    CanonicalField, CanonicalRecord, DocumentId, FieldSource, LayoutRegion, NerSpan, RawDocument,
    RecordId, TableCell, TextSpan,
};
use crate::error::ExternalError;

pub use ingest::{content_hash, FsIngestSource};
pub use pdf::PdfTextExtractor;
pub use sink::JsonFileSink;

pub trait IngestSource: Send + Sync {
    fn ingest(&self, path: &Path) -> Result<RawDocument, ExternalError>;
}

pub trait TextExtractor: Send + Sync {
    fn extract_text(&self, document: &RawDocument) -> Result<Vec<TextSpan>, ExternalError>;
}

pub trait TableExtractor: Send + Sync {
    fn extract_tables(&self, document: &RawDocument) -> Result<Vec<TableCell>, ExternalError>;
}

pub trait LayoutExtractor: Send + Sync {
    fn extract_layout(&self, document: &RawDocument) -> Result<Vec<LayoutRegion>, ExternalError>;
}

pub trait EntityExtractor: Send + Sync {
    fn extract_entities(&self, document: &RawDocument) -> Result<Vec<NerSpan>, ExternalError>;
}

/// Metadata persisted alongside a canonical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordProvenance {
    pub document_id: DocumentId,
    pub source_path: PathBuf,
    pub sources: BTreeMap<CanonicalField, Vec<FieldSource>>,
}

/// Persistence engine. Must be idempotent on `provenance.document_id`:
/// persisting the same document again updates the stored record.
pub trait RecordSink: Send + Sync {
    fn persist(
        &self,
        record: &CanonicalRecord,
        provenance: &RecordProvenance,
    ) -> Result<RecordId, ExternalError>;
}

/// Extractor that is not installed; yields nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Disabled;

impl TextExtractor for Disabled {
    fn extract_text(&self, _document: &RawDocument) -> Result<Vec<TextSpan>, ExternalError> {
        Ok(Vec::new())
    }
}

impl TableExtractor for Disabled {
    fn extract_tables(&self, _document: &RawDocument) -> Result<Vec<TableCell>, ExternalError> {
        Ok(Vec::new())
    }
}

impl LayoutExtractor for Disabled {
    fn extract_layout(&self, _document: &RawDocument) -> Result<Vec<LayoutRegion>, ExternalError> {
        Ok(Vec::new())
    }
}

impl EntityExtractor for Disabled {
    fn extract_entities(&self, _document: &RawDocument) -> Result<Vec<NerSpan>, ExternalError> {
        Ok(Vec::new())
    }
}

/// The four extractors consulted by the extraction stage.
#[derive(Clone)]
pub struct Extractors {
    pub text: Arc<dyn TextExtractor>,
    pub tables: Arc<dyn TableExtractor>,
    pub layout: Arc<dyn LayoutExtractor>,
    pub entities: Arc<dyn EntityExtractor>,
}

impl Extractors {
    /// Only native PDF text; tables, layout and entities are disabled.
    pub fn text_only(text: Arc<dyn TextExtractor>) -> Self {
        Self {
            text,
            tables: Arc::new(Disabled),
            layout: Arc::new(Disabled),
            entities: Arc::new(Disabled),
        }
    }

    pub fn with_tables(mut self, tables: Arc<dyn TableExtractor>) -> Self {
        self.tables = tables;
        self
    }

    pub fn with_layout(mut self, layout: Arc<dyn LayoutExtractor>) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_entities(mut self, entities: Arc<dyn EntityExtractor>) -> Self {
        self.entities = entities;
        self
    }
}

impl Default for Extractors {
    fn default() -> Self {
        Self::text_only(Arc::new(PdfTextExtractor::new()))
    }
}
