use std::sync::Arc;

use crate::document::{DocumentRecord, Stage, StageArtifact};
use crate::external::{RecordProvenance, RecordSink};

use super::{PipelineStage, StageFailure, StageResult};

/// Hands the canonical record and its provenance to the record sink.
pub struct StorageStage {
    sink: Arc<dyn RecordSink>,
}

impl StorageStage {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self { sink }
    }

    fn run(&self, document: &DocumentRecord) -> Result<StageArtifact, StageFailure> {
        let normalized = document
            .normalized()
            .ok_or_else(|| StageFailure::system_fault("record has no normalized document"))?;

        let provenance = RecordProvenance {
            document_id: document.id().clone(),
            source_path: document.source_path().to_path_buf(),
            sources: normalized.sources.clone(),
        };

        let record_id = self.sink.persist(&normalized.record, &provenance)?;
        Ok(StageArtifact::Stored(record_id))
    }
}

impl PipelineStage for StorageStage {
    fn stage(&self) -> Stage {
        Stage::Store
    }

    fn execute(&self, document: &DocumentRecord) -> StageResult {
        self.run(document).into()
    }
}
