use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::document::RawDocument;
use crate::error::ExternalError;
use crate::external::IngestSource;

const PDF_MAGIC: &[u8] = b"%PDF-";

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Reads source files from the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct FsIngestSource {
    /// Accept files that do not start with the PDF header.
    allow_non_pdf: bool,
}

impl FsIngestSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_non_pdf(mut self, allow: bool) -> Self {
        self.allow_non_pdf = allow;
        self
    }
}

impl IngestSource for FsIngestSource {
    fn ingest(&self, path: &Path) -> Result<RawDocument, ExternalError> {
        let _span = tracing::info_span!("ingest.read").entered();

        let bytes = std::fs::read(path).map_err(|e| {
            ExternalError::InvalidFormat(format!("cannot read {}: {}", path.display(), e))
        })?;

        if bytes.is_empty() {
            return Err(ExternalError::InvalidFormat(format!(
                "{} is empty",
                path.display()
            )));
        }

        if !self.allow_non_pdf && !bytes.starts_with(PDF_MAGIC) {
            return Err(ExternalError::InvalidFormat(format!(
                "{} does not start with a PDF header",
                path.display()
            )));
        }

        let mime_type = mime_guess::from_path(path).first().map(|m| m.to_string());

        Ok(RawDocument {
            content_hash: content_hash(&bytes),
            bytes: Arc::from(bytes),
            mime_type,
        })
    }
}
