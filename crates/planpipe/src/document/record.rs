use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::artifact::{ExtractionArtifact, RawDocument};
use super::canonical::{CanonicalRecord, NormalizedDocument, RecordId};
use crate::error::ErrorKind;

/// Stable identifier of a document: the SHA-256 of its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn from_content_hash(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The four ordered processing steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Extract,
    Normalize,
    Store,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Ingest, Stage::Extract, Stage::Normalize, Stage::Store];

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Ingest => Some(Stage::Extract),
            Stage::Extract => Some(Stage::Normalize),
            Stage::Normalize => Some(Stage::Store),
            Stage::Store => None,
        }
    }

    pub fn previous(self) -> Option<Stage> {
        match self {
            Stage::Ingest => None,
            Stage::Extract => Some(Stage::Ingest),
            Stage::Normalize => Some(Stage::Extract),
            Stage::Store => Some(Stage::Normalize),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Extract => "extract",
            Stage::Normalize => "normalize",
            Stage::Store => "store",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Retrying,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

/// Final disposition of a document. Set once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalOutcome {
    Stored,
    Rejected,
    Abandoned,
}

impl fmt::Display for TerminalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminalOutcome::Stored => "stored",
            TerminalOutcome::Rejected => "rejected",
            TerminalOutcome::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Typed output of a stage, kept on the record.
#[derive(Debug, Clone)]
pub enum StageArtifact {
    Ingested(RawDocument),
    Extracted(ExtractionArtifact),
    Normalized(NormalizedDocument),
    Stored(RecordId),
}

impl StageArtifact {
    pub fn stage(&self) -> Stage {
        match self {
            StageArtifact::Ingested(_) => Stage::Ingest,
            StageArtifact::Extracted(_) => Stage::Extract,
            StageArtifact::Normalized(_) => Stage::Normalize,
            StageArtifact::Stored(_) => Stage::Store,
        }
    }
}

/// Why a document was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
    /// The retry budget ran out on a transient error.
    pub escalated: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("document is already terminal ({0})")]
    Terminal(TerminalOutcome),

    #[error("stage {stage} cannot start before {required} has succeeded")]
    OutOfOrder { stage: Stage, required: Stage },

    #[error("stage {0} is already running")]
    AlreadyRunning(Stage),

    #[error("stage {0} already succeeded")]
    AlreadySucceeded(Stage),

    #[error("stage {0} is not running")]
    NotRunning(Stage),

    #[error("artifact for stage {artifact} offered to stage {stage}")]
    ArtifactMismatch { stage: Stage, artifact: Stage },

    #[error("stage {later} is {status} while {earlier} has not succeeded")]
    OrderingViolated {
        earlier: Stage,
        later: Stage,
        status: StageStatus,
    },

    #[error("stages {0} and {1} are running at the same time")]
    ConcurrentStages(Stage, Stage),
}

/// Checks the ordering and single-running-stage invariants over a status map.
pub fn check_stage_invariants(statuses: &BTreeMap<Stage, StageStatus>) -> Result<(), RecordError> {
    let status_of = |stage: Stage| statuses.get(&stage).copied().unwrap_or(StageStatus::Pending);

    let mut running: Option<Stage> = None;
    for stage in Stage::ALL {
        let status = status_of(stage);
        if status == StageStatus::Running {
            if let Some(other) = running {
                return Err(RecordError::ConcurrentStages(other, stage));
            }
            running = Some(stage);
        }

        if matches!(status, StageStatus::Running | StageStatus::Succeeded) {
            for earlier in Stage::ALL.iter().copied().take_while(|s| *s < stage) {
                if status_of(earlier) != StageStatus::Succeeded {
                    return Err(RecordError::OrderingViolated {
                        earlier,
                        later: stage,
                        status,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Accumulated state of one input document.
///
/// Mutated only by the stage runner that currently owns it; the coordinator
/// hands the record from runner to runner at stage boundaries.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    id: DocumentId,
    source_path: PathBuf,
    stage_status: BTreeMap<Stage, StageStatus>,
    attempts: BTreeMap<Stage, u32>,
    raw_artifacts: BTreeMap<Stage, StageArtifact>,
    canonical_record: Option<CanonicalRecord>,
    terminal_outcome: Option<TerminalOutcome>,
    failure: Option<FailureReport>,
}

impl DocumentRecord {
    /// Creates the record for a freshly ingested source file. Ingestion has
    /// already succeeded, so the record starts at `extract`.
    pub fn ingested(source_path: impl Into<PathBuf>, raw: RawDocument) -> Self {
        let mut stage_status: BTreeMap<Stage, StageStatus> = Stage::ALL
            .iter()
            .map(|stage| (*stage, StageStatus::Pending))
            .collect();
        stage_status.insert(Stage::Ingest, StageStatus::Succeeded);

        let mut attempts = BTreeMap::new();
        attempts.insert(Stage::Ingest, 1);

        let id = DocumentId::from_content_hash(raw.content_hash.clone());
        let mut raw_artifacts = BTreeMap::new();
        raw_artifacts.insert(Stage::Ingest, StageArtifact::Ingested(raw));

        Self {
            id,
            source_path: source_path.into(),
            stage_status,
            attempts,
            raw_artifacts,
            canonical_record: None,
            terminal_outcome: None,
            failure: None,
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn stage_status(&self, stage: Stage) -> StageStatus {
        self.stage_status
            .get(&stage)
            .copied()
            .unwrap_or(StageStatus::Pending)
    }

    pub fn attempts(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    pub fn artifact(&self, stage: Stage) -> Option<&StageArtifact> {
        self.raw_artifacts.get(&stage)
    }

    pub fn raw_document(&self) -> Option<&RawDocument> {
        match self.artifact(Stage::Ingest) {
            Some(StageArtifact::Ingested(raw)) => Some(raw),
            _ => None,
        }
    }

    pub fn extraction(&self) -> Option<&ExtractionArtifact> {
        match self.artifact(Stage::Extract) {
            Some(StageArtifact::Extracted(artifact)) => Some(artifact),
            _ => None,
        }
    }

    pub fn normalized(&self) -> Option<&NormalizedDocument> {
        match self.artifact(Stage::Normalize) {
            Some(StageArtifact::Normalized(doc)) => Some(doc),
            _ => None,
        }
    }

    pub fn stored_id(&self) -> Option<&RecordId> {
        match self.artifact(Stage::Store) {
            Some(StageArtifact::Stored(id)) => Some(id),
            _ => None,
        }
    }

    pub fn canonical_record(&self) -> Option<&CanonicalRecord> {
        self.canonical_record.as_ref()
    }

    pub fn terminal_outcome(&self) -> Option<TerminalOutcome> {
        self.terminal_outcome
    }

    pub fn failure(&self) -> Option<&FailureReport> {
        self.failure.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_outcome.is_some()
    }

    pub fn running_stage(&self) -> Option<Stage> {
        Stage::ALL
            .into_iter()
            .find(|stage| self.stage_status(*stage) == StageStatus::Running)
    }

    /// The first stage that has not succeeded yet, if the document is still live.
    pub fn next_stage(&self) -> Option<Stage> {
        if self.is_terminal() {
            return None;
        }
        Stage::ALL
            .into_iter()
            .find(|stage| self.stage_status(*stage) != StageStatus::Succeeded)
    }

    /// Marks `stage` as running and counts the attempt. Returns the attempt number.
    pub fn begin_attempt(&mut self, stage: Stage) -> Result<u32, RecordError> {
        if let Some(outcome) = self.terminal_outcome {
            return Err(RecordError::Terminal(outcome));
        }
        if let Some(running) = self.running_stage() {
            return Err(RecordError::AlreadyRunning(running));
        }
        if self.stage_status(stage) == StageStatus::Succeeded {
            return Err(RecordError::AlreadySucceeded(stage));
        }
        if let Some(previous) = stage.previous() {
            if self.stage_status(previous) != StageStatus::Succeeded {
                return Err(RecordError::OutOfOrder {
                    stage,
                    required: previous,
                });
            }
        }

        self.stage_status.insert(stage, StageStatus::Running);
        let attempts = self.attempts.entry(stage).or_insert(0);
        *attempts += 1;
        Ok(*attempts)
    }

    /// Stores the artifact of a successful attempt, replacing whatever an
    /// earlier failed attempt left behind.
    pub fn record_success(
        &mut self,
        stage: Stage,
        artifact: StageArtifact,
    ) -> Result<(), RecordError> {
        self.require_running(stage)?;
        if artifact.stage() != stage {
            return Err(RecordError::ArtifactMismatch {
                stage,
                artifact: artifact.stage(),
            });
        }

        if let StageArtifact::Normalized(doc) = &artifact {
            self.canonical_record = Some(doc.record.clone());
        }
        self.raw_artifacts.insert(stage, artifact);
        self.stage_status.insert(stage, StageStatus::Succeeded);

        if stage == Stage::Store {
            self.terminal_outcome = Some(TerminalOutcome::Stored);
        }
        Ok(())
    }

    pub fn mark_retrying(&mut self, stage: Stage) -> Result<(), RecordError> {
        self.require_running(stage)?;
        self.stage_status.insert(stage, StageStatus::Retrying);
        Ok(())
    }

    /// Fails `stage` and rejects the document.
    pub fn mark_failed(&mut self, report: FailureReport) -> Result<(), RecordError> {
        self.require_running(report.stage)?;
        self.stage_status.insert(report.stage, StageStatus::Failed);
        self.terminal_outcome = Some(TerminalOutcome::Rejected);
        self.failure = Some(report);
        Ok(())
    }

    /// Keeps the canonical record assembled by a normalization attempt that
    /// was rejected, so its validation errors stay queryable.
    pub fn keep_rejected_record(&mut self, record: CanonicalRecord) {
        if self.terminal_outcome == Some(TerminalOutcome::Rejected) {
            self.canonical_record = Some(record);
        }
    }

    /// Drops the result of an in-flight attempt after cancellation.
    pub fn abandon_attempt(&mut self, stage: Stage) -> Result<(), RecordError> {
        self.require_running(stage)?;
        self.stage_status.insert(stage, StageStatus::Pending);
        self.terminal_outcome = Some(TerminalOutcome::Abandoned);
        Ok(())
    }

    /// Rejects the document outside the normal attempt flow, after a system
    /// fault. A running stage is marked failed. Returns false when the
    /// document already had an outcome.
    pub fn force_reject(&mut self, report: FailureReport) -> bool {
        if self.terminal_outcome.is_some() {
            return false;
        }
        if self.stage_status(report.stage) == StageStatus::Running {
            self.stage_status.insert(report.stage, StageStatus::Failed);
        }
        self.terminal_outcome = Some(TerminalOutcome::Rejected);
        self.failure = Some(report);
        true
    }

    /// Abandons a document that is not being worked on. Returns false when the
    /// document already had an outcome.
    pub fn abandon(&mut self) -> bool {
        if self.terminal_outcome.is_some() {
            return false;
        }
        self.terminal_outcome = Some(TerminalOutcome::Abandoned);
        true
    }

    pub fn check_invariants(&self) -> Result<(), RecordError> {
        check_stage_invariants(&self.stage_status)
    }

    pub fn status(&self) -> DocumentStatus {
        DocumentStatus {
            id: self.id.clone(),
            source_path: self.source_path.clone(),
            stage_status: self.stage_status.clone(),
            attempts: self.attempts.clone(),
            terminal_outcome: self.terminal_outcome,
            failure: self.failure.clone(),
            validation_errors: self
                .canonical_record
                .as_ref()
                .map(|r| r.validation_errors.iter().map(|e| e.rule_id.clone()).collect())
                .unwrap_or_default(),
        }
    }

    fn require_running(&self, stage: Stage) -> Result<(), RecordError> {
        if self.stage_status(stage) != StageStatus::Running {
            return Err(RecordError::NotRunning(stage));
        }
        Ok(())
    }
}

/// Point-in-time view of a document returned by progress queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStatus {
    pub id: DocumentId,
    pub source_path: PathBuf,
    pub stage_status: BTreeMap<Stage, StageStatus>,
    pub attempts: BTreeMap<Stage, u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_outcome: Option<TerminalOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
    /// Identifiers of the validation rules that failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
}

impl DocumentStatus {
    pub fn stage_status(&self, stage: Stage) -> StageStatus {
        self.stage_status
            .get(&stage)
            .copied()
            .unwrap_or(StageStatus::Pending)
    }

    pub fn attempts(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    pub fn check_invariants(&self) -> Result<(), RecordError> {
        check_stage_invariants(&self.stage_status)
    }
}
