use std::sync::Arc;

use crate::document::{DocumentRecord, Stage, StageArtifact};
use crate::error::ErrorKind;
use crate::normalize::NormalizationEngine;

use super::{PipelineStage, StageFailure, StageResult};

pub struct NormalizationStage {
    engine: Arc<NormalizationEngine>,
}

impl NormalizationStage {
    pub fn new(engine: Arc<NormalizationEngine>) -> Self {
        Self { engine }
    }

    fn run(&self, document: &DocumentRecord) -> Result<StageArtifact, StageFailure> {
        let extraction = document
            .extraction()
            .ok_or_else(|| StageFailure::system_fault("record has no extraction artifact"))?;

        match self.engine.normalize(extraction) {
            Ok(normalized) => Ok(StageArtifact::Normalized(normalized)),
            Err(rejection) => Err(StageFailure::new(
                ErrorKind::ValidationFailure,
                rejection.to_string(),
            )
            .with_rejected_record(rejection.document.record)),
        }
    }
}

impl PipelineStage for NormalizationStage {
    fn stage(&self) -> Stage {
        Stage::Normalize
    }

    fn execute(&self, document: &DocumentRecord) -> StageResult {
        self.run(document).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ExtractionArtifact, RawDocument};

    #[test]
    fn test_missing_extraction_is_system_fault() {
        let engine = NormalizationEngine::new(&Default::default(), true).unwrap();
        let stage = NormalizationStage::new(Arc::new(engine));
        let record = DocumentRecord::ingested(
            "/plans/a.pdf",
            RawDocument {
                bytes: Arc::from(b"%PDF-1.7".to_vec()),
                content_hash: "abc".into(),
                mime_type: None,
            },
        );

        match stage.execute(&record) {
            StageResult::Failure(failure) => assert_eq!(failure.kind, ErrorKind::SystemFault),
            other => panic!("Expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_rules_produce_empty_record() {
        let engine = NormalizationEngine::new(&Default::default(), true).unwrap();
        let stage = NormalizationStage::new(Arc::new(engine));
        let mut record = DocumentRecord::ingested(
            "/plans/a.pdf",
            RawDocument {
                bytes: Arc::from(b"%PDF-1.7".to_vec()),
                content_hash: "abc".into(),
                mime_type: None,
            },
        );
        record.begin_attempt(Stage::Extract).unwrap();
        record
            .record_success(
                Stage::Extract,
                StageArtifact::Extracted(ExtractionArtifact::default()),
            )
            .unwrap();

        assert!(stage.execute(&record).is_success());
    }
}
