use crate::document::{DocumentRecord, ExtractionArtifact, ExtractorKind, Stage, StageArtifact};
use crate::external::Extractors;

use super::{PipelineStage, StageFailure, StageResult};

/// Runs the four extractors over the raw document and bundles their output.
///
/// Any extractor failure fails the whole attempt; a retry reruns all four.
pub struct ExtractionStage {
    extractors: Extractors,
}

impl ExtractionStage {
    pub fn new(extractors: Extractors) -> Self {
        Self { extractors }
    }

    fn run(&self, document: &DocumentRecord) -> Result<StageArtifact, StageFailure> {
        let raw = document
            .raw_document()
            .ok_or_else(|| StageFailure::system_fault("record has no ingested bytes"))?;

        let text = self.extractors.text.extract_text(raw)?;
        let tables = self.extractors.tables.extract_tables(raw)?;
        let layout = self.extractors.layout.extract_layout(raw)?;
        let entities = self.extractors.entities.extract_entities(raw)?;

        let artifact = ExtractionArtifact::assemble(text, tables, layout, entities);
        tracing::debug!(
            text = artifact.count(ExtractorKind::Text),
            tables = artifact.count(ExtractorKind::Table),
            layout = artifact.count(ExtractorKind::Layout),
            entities = artifact.count(ExtractorKind::Entity),
            "Extraction finished"
        );
        Ok(StageArtifact::Extracted(artifact))
    }
}

impl PipelineStage for ExtractionStage {
    fn stage(&self) -> Stage {
        Stage::Extract
    }

    fn execute(&self, document: &DocumentRecord) -> StageResult {
        self.run(document).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{NerSpan, RawDocument, TextSpan};
    use crate::error::{ErrorKind, ExternalError};
    use crate::external::{EntityExtractor, TextExtractor};
    use std::sync::Arc;

    struct FixedText(Vec<&'static str>);

    impl TextExtractor for FixedText {
        fn extract_text(&self, _document: &RawDocument) -> Result<Vec<TextSpan>, ExternalError> {
            Ok(self
                .0
                .iter()
                .enumerate()
                .map(|(i, t)| TextSpan {
                    text: t.to_string(),
                    page: 1,
                    line: i as u32 + 1,
                    confidence: 1.0,
                })
                .collect())
        }
    }

    struct DownNer;

    impl EntityExtractor for DownNer {
        fn extract_entities(&self, _document: &RawDocument) -> Result<Vec<NerSpan>, ExternalError> {
            Err(ExternalError::Unavailable("ner service down".into()))
        }
    }

    fn record() -> DocumentRecord {
        DocumentRecord::ingested(
            "/plans/a.pdf",
            RawDocument {
                bytes: Arc::from(b"%PDF-1.7".to_vec()),
                content_hash: "abc".into(),
                mime_type: None,
            },
        )
    }

    #[test]
    fn test_extraction_collects_items() {
        let stage = ExtractionStage::new(Extractors::text_only(Arc::new(FixedText(vec![
            "123 Main St",
            "12 ft × 20 ft",
        ]))));

        match stage.execute(&record()) {
            StageResult::Success(StageArtifact::Extracted(artifact)) => {
                assert_eq!(artifact.items.len(), 2);
                assert_eq!(artifact.items[1].provenance.sequence, 1);
            }
            other => panic!("Expected extraction artifact, got {:?}", other),
        }
    }

    #[test]
    fn test_extractor_outage_is_transient() {
        let stage = ExtractionStage::new(
            Extractors::text_only(Arc::new(FixedText(vec!["x"]))).with_entities(Arc::new(DownNer)),
        );

        match stage.execute(&record()) {
            StageResult::Failure(failure) => {
                assert_eq!(failure.kind, ErrorKind::TransientExternal);
                assert!(failure.retryable());
            }
            other => panic!("Expected failure, got {:?}", other),
        }
    }
}
