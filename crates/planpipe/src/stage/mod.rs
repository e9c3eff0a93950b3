//! The uniform contract every pipeline stage implements.
//!
//! A stage reads the document record it is handed and returns its output.
//! It never writes into the record; the stage runner applies the result, so
//! every attempt's artifact fully replaces whatever an earlier attempt left.

pub mod extract;
pub mod normalize;
pub mod store;

use std::fmt;
use std::sync::Arc;

use crate::document::{CanonicalRecord, DocumentRecord, Stage, StageArtifact};
use crate::error::{ErrorKind, ExternalError};
use crate::external::{Extractors, RecordSink};
use crate::normalize::NormalizationEngine;

pub use extract::ExtractionStage;
pub use normalize::NormalizationStage;
pub use store::StorageStage;

/// Why a stage attempt did not produce an artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Canonical record assembled before a fatal validation rule fired.
    pub rejected_record: Option<CanonicalRecord>,
}

impl StageFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            rejected_record: None,
        }
    }

    pub fn system_fault(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SystemFault, message)
    }

    pub fn with_rejected_record(mut self, record: CanonicalRecord) -> Self {
        self.rejected_record = Some(record);
        self
    }

    pub fn retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<ExternalError> for StageFailure {
    fn from(err: ExternalError) -> Self {
        StageFailure::new(err.kind(), err.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum StageResult {
    Success(StageArtifact),
    Failure(StageFailure),
}

impl StageResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StageResult::Success(_))
    }
}

impl From<Result<StageArtifact, StageFailure>> for StageResult {
    fn from(result: Result<StageArtifact, StageFailure>) -> Self {
        match result {
            Ok(artifact) => StageResult::Success(artifact),
            Err(failure) => StageResult::Failure(failure),
        }
    }
}

pub trait PipelineStage: Send + Sync {
    /// The stage this implementation performs.
    fn stage(&self) -> Stage;

    /// Runs one attempt against a snapshot of the document.
    fn execute(&self, document: &DocumentRecord) -> StageResult;
}

/// The stage implementations the runner dispatches to.
#[derive(Clone)]
pub struct StageSet {
    extract: Arc<dyn PipelineStage>,
    normalize: Arc<dyn PipelineStage>,
    store: Arc<dyn PipelineStage>,
}

impl StageSet {
    pub fn new(
        extract: Arc<dyn PipelineStage>,
        normalize: Arc<dyn PipelineStage>,
        store: Arc<dyn PipelineStage>,
    ) -> Self {
        Self {
            extract,
            normalize,
            store,
        }
    }

    /// The stock stages over the given collaborators.
    pub fn standard(
        extractors: Extractors,
        engine: Arc<NormalizationEngine>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self::new(
            Arc::new(ExtractionStage::new(extractors)),
            Arc::new(NormalizationStage::new(engine)),
            Arc::new(StorageStage::new(sink)),
        )
    }

    /// Ingestion happens before a record exists, so it has no stage here.
    pub fn get(&self, stage: Stage) -> Option<&Arc<dyn PipelineStage>> {
        match stage {
            Stage::Ingest => None,
            Stage::Extract => Some(&self.extract),
            Stage::Normalize => Some(&self.normalize),
            Stage::Store => Some(&self.store),
        }
    }

    pub fn with(mut self, stage: Arc<dyn PipelineStage>) -> Self {
        match stage.stage() {
            Stage::Ingest => {}
            Stage::Extract => self.extract = stage,
            Stage::Normalize => self.normalize = stage,
            Stage::Store => self.store = stage,
        }
        self
    }
}
