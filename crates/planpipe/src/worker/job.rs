use std::fmt;

use crate::document::{DocumentId, DocumentStatus, Stage};

/// One queued stage attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub document_id: DocumentId,
    pub stage: Stage,
}

impl WorkItem {
    pub fn new(document_id: DocumentId, stage: Stage) -> Self {
        Self { document_id, stage }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.document_id.short(), self.stage)
    }
}

/// Told when a registered document starts its first attempt and when it
/// reaches a terminal outcome. Called from worker threads.
pub trait DocumentListener: Send + Sync {
    fn started(&self, _document_id: &DocumentId) {}

    fn finished(&self, status: &DocumentStatus);
}

/// Result of handing a record to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Accepted(DocumentId),
    /// A record with the same content hash is already registered.
    Duplicate(DocumentStatus),
}
