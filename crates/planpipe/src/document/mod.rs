//! Document records and the artifacts attached to them.

pub mod artifact;
pub mod canonical;
pub mod record;

pub use artifact::{
    ExtractedItem, ExtractionArtifact, ExtractorKind, LayoutRegion, NerSpan, Provenance,
    RawDocument, RawValue, TableCell, TextSpan,
};
pub use canonical::{
    CanonicalField, CanonicalRecord, Dimension, FieldSource, LengthUnit, NormalizedDocument,
    RecordId, ValidationError,
};
pub use record::{
    check_stage_invariants, DocumentId, DocumentRecord, DocumentStatus, FailureReport,
    RecordError, Stage, StageArtifact, StageStatus, TerminalOutcome,
};
