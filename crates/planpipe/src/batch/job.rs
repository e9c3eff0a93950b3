use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::{DocumentId, DocumentStatus, Stage, TerminalOutcome};
use crate::error::ErrorKind;
use crate::worker::DocumentListener;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A rejected member of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionEntry {
    /// Absent when the source never became a record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<DocumentId>,
    pub source_path: PathBuf,
    pub stage: Stage,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub escalated: bool,
}

/// A source whose bytes matched a document that was already registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateEntry {
    pub source_path: PathBuf,
    pub document_id: DocumentId,
}

/// Snapshot of the batch counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub total: usize,
    pub queued: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    /// Rejected and abandoned members.
    pub failed: usize,
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub created_at: DateTime<Utc>,
    pub progress: BatchProgress,
    pub stored: Vec<DocumentId>,
    pub abandoned: Vec<DocumentId>,
    pub rejections: Vec<RejectionEntry>,
    pub duplicates: Vec<DuplicateEntry>,
}

impl BatchReport {
    pub fn has_rejections(&self) -> bool {
        !self.rejections.is_empty()
    }
}

#[derive(Debug, Default)]
struct Outcomes {
    members: Vec<DocumentId>,
    stored: Vec<DocumentId>,
    abandoned: Vec<DocumentId>,
    rejections: Vec<RejectionEntry>,
    duplicates: Vec<DuplicateEntry>,
}

/// Documents submitted together, with counters updated by the workers.
///
/// Reading progress never takes a lock, so a slow member cannot hold up a
/// progress query.
#[derive(Debug)]
pub struct BatchJob {
    id: BatchId,
    created_at: DateTime<Utc>,
    total: AtomicUsize,
    queued: AtomicUsize,
    in_progress: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    sealed: AtomicBool,
    outcomes: Mutex<Outcomes>,
}

impl BatchJob {
    pub fn new() -> Self {
        Self {
            id: BatchId::new(),
            created_at: Utc::now(),
            total: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            in_progress: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
            outcomes: Mutex::new(Outcomes::default()),
        }
    }

    pub fn id(&self) -> &BatchId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn outcomes(&self) -> MutexGuard<'_, Outcomes> {
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Counts a member before it is handed to the coordinator.
    pub fn add_member(&self, id: DocumentId) {
        self.outcomes().members.push(id);
        self.total.fetch_add(1, Ordering::SeqCst);
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    /// Takes back a member the coordinator did not accept.
    pub fn withdraw_member(&self, id: &DocumentId) {
        let mut outcomes = self.outcomes();
        if let Some(pos) = outcomes.members.iter().position(|m| m == id) {
            outcomes.members.remove(pos);
            decrement(&self.total);
            decrement(&self.queued);
        }
    }

    /// Records a source that failed before it became a record.
    pub fn reject_source(&self, source_path: &Path, stage: Stage, kind: ErrorKind, message: String) {
        self.outcomes().rejections.push(RejectionEntry {
            document_id: None,
            source_path: source_path.to_path_buf(),
            stage,
            kind,
            message,
            escalated: false,
        });
        self.total.fetch_add(1, Ordering::SeqCst);
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_duplicate(&self, source_path: &Path, document_id: DocumentId) {
        self.outcomes().duplicates.push(DuplicateEntry {
            source_path: source_path.to_path_buf(),
            document_id,
        });
    }

    /// Marks the end of submission. The batch cannot complete before this.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn members(&self) -> Vec<DocumentId> {
        self.outcomes().members.clone()
    }

    pub fn progress(&self) -> BatchProgress {
        let queued = self.queued.load(Ordering::SeqCst);
        let in_progress = self.in_progress.load(Ordering::SeqCst);
        BatchProgress {
            total: self.total.load(Ordering::SeqCst),
            queued,
            in_progress,
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            complete: self.sealed.load(Ordering::SeqCst) && queued == 0 && in_progress == 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.progress().complete
    }

    pub fn report(&self) -> BatchReport {
        let outcomes = self.outcomes();
        BatchReport {
            batch_id: self.id.clone(),
            created_at: self.created_at,
            progress: self.progress(),
            stored: outcomes.stored.clone(),
            abandoned: outcomes.abandoned.clone(),
            rejections: outcomes.rejections.clone(),
            duplicates: outcomes.duplicates.clone(),
        }
    }
}

impl Default for BatchJob {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentListener for BatchJob {
    fn started(&self, _document_id: &DocumentId) {
        decrement(&self.queued);
        self.in_progress.fetch_add(1, Ordering::SeqCst);
    }

    fn finished(&self, status: &DocumentStatus) {
        let Some(outcome) = status.terminal_outcome else {
            return;
        };

        // Record the outcome before the counters, so a complete batch always
        // has a complete report.
        {
            let mut outcomes = self.outcomes();
            match outcome {
                TerminalOutcome::Stored => outcomes.stored.push(status.id.clone()),
                TerminalOutcome::Abandoned => outcomes.abandoned.push(status.id.clone()),
                TerminalOutcome::Rejected => {
                    let entry = match &status.failure {
                        Some(failure) => RejectionEntry {
                            document_id: Some(status.id.clone()),
                            source_path: status.source_path.clone(),
                            stage: failure.stage,
                            kind: failure.kind,
                            message: failure.message.clone(),
                            escalated: failure.escalated,
                        },
                        None => RejectionEntry {
                            document_id: Some(status.id.clone()),
                            source_path: status.source_path.clone(),
                            stage: Stage::Ingest,
                            kind: ErrorKind::SystemFault,
                            message: "rejected without a failure report".to_string(),
                            escalated: false,
                        },
                    };
                    outcomes.rejections.push(entry);
                }
            }
        }

        match outcome {
            TerminalOutcome::Stored => self.succeeded.fetch_add(1, Ordering::SeqCst),
            TerminalOutcome::Rejected | TerminalOutcome::Abandoned => {
                self.failed.fetch_add(1, Ordering::SeqCst)
            }
        };

        let started = Stage::ALL
            .iter()
            .any(|stage| *stage != Stage::Ingest && status.attempts(*stage) > 0);
        if started {
            decrement(&self.in_progress);
        } else {
            decrement(&self.queued);
        }
    }
}

fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
}
