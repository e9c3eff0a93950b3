//! Structured pipeline events and the sinks that receive them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::document::{DocumentId, Stage, StageStatus, TerminalOutcome};
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A source file was ingested and registered.
    Ingested,
    /// A source file could not be ingested.
    IngestRejected,
    StageStarted,
    StageSucceeded,
    StageRetrying,
    StageFailed,
    /// An attempt finished after its document was cancelled.
    StageAbandoned,
    /// The document reached its terminal outcome.
    Completed,
    /// A system fault stopped the coordinator from accepting new work.
    IntakeHalted,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Ingested => write!(f, "Ingested"),
            EventKind::IngestRejected => write!(f, "Ingest rejected"),
            EventKind::StageStarted => write!(f, "Stage started"),
            EventKind::StageSucceeded => write!(f, "Stage succeeded"),
            EventKind::StageRetrying => write!(f, "Stage retrying"),
            EventKind::StageFailed => write!(f, "Stage failed"),
            EventKind::StageAbandoned => write!(f, "Stage abandoned"),
            EventKind::Completed => write!(f, "Completed"),
            EventKind::IntakeHalted => write!(f, "Intake halted"),
        }
    }
}

/// One observable step of a document's progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEvent {
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<DocumentId>,
    /// File name of the source, never the full path.
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_ms: Option<u64>,
    /// The retry budget ran out (failure events only).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub escalated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TerminalOutcome>,
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    fn new(kind: EventKind, document_id: Option<&DocumentId>, filename: &str) -> Self {
        Self {
            kind,
            document_id: document_id.cloned(),
            filename: filename.to_string(),
            stage: None,
            status: None,
            attempt: None,
            latency_ms: None,
            error_kind: None,
            error: None,
            retry_in_ms: None,
            escalated: false,
            outcome: None,
            timestamp: Utc::now(),
        }
    }

    pub fn ingested(document_id: &DocumentId, filename: &str) -> Self {
        let mut event = Self::new(EventKind::Ingested, Some(document_id), filename);
        event.stage = Some(Stage::Ingest);
        event.status = Some(StageStatus::Succeeded);
        event
    }

    pub fn ingest_rejected(filename: &str, kind: ErrorKind, error: &str) -> Self {
        let mut event = Self::new(EventKind::IngestRejected, None, filename);
        event.stage = Some(Stage::Ingest);
        event.status = Some(StageStatus::Failed);
        event.error_kind = Some(kind);
        event.error = Some(error.to_string());
        event
    }

    pub fn stage_started(document_id: &DocumentId, filename: &str, stage: Stage, attempt: u32) -> Self {
        let mut event = Self::new(EventKind::StageStarted, Some(document_id), filename);
        event.stage = Some(stage);
        event.status = Some(StageStatus::Running);
        event.attempt = Some(attempt);
        event
    }

    pub fn stage_succeeded(
        document_id: &DocumentId,
        filename: &str,
        stage: Stage,
        attempt: u32,
        latency: Duration,
    ) -> Self {
        let mut event = Self::new(EventKind::StageSucceeded, Some(document_id), filename);
        event.stage = Some(stage);
        event.status = Some(StageStatus::Succeeded);
        event.attempt = Some(attempt);
        event.latency_ms = Some(latency.as_millis() as u64);
        event
    }

    #[allow(clippy::too_many_arguments)]
    pub fn stage_retrying(
        document_id: &DocumentId,
        filename: &str,
        stage: Stage,
        attempt: u32,
        latency: Duration,
        kind: ErrorKind,
        error: &str,
        delay: Duration,
    ) -> Self {
        let mut event = Self::new(EventKind::StageRetrying, Some(document_id), filename);
        event.stage = Some(stage);
        event.status = Some(StageStatus::Retrying);
        event.attempt = Some(attempt);
        event.latency_ms = Some(latency.as_millis() as u64);
        event.error_kind = Some(kind);
        event.error = Some(error.to_string());
        event.retry_in_ms = Some(delay.as_millis() as u64);
        event
    }

    #[allow(clippy::too_many_arguments)]
    pub fn stage_failed(
        document_id: &DocumentId,
        filename: &str,
        stage: Stage,
        attempt: u32,
        latency: Duration,
        kind: ErrorKind,
        error: &str,
        escalated: bool,
    ) -> Self {
        let mut event = Self::new(EventKind::StageFailed, Some(document_id), filename);
        event.stage = Some(stage);
        event.status = Some(StageStatus::Failed);
        event.attempt = Some(attempt);
        event.latency_ms = Some(latency.as_millis() as u64);
        event.error_kind = Some(kind);
        event.error = Some(error.to_string());
        event.escalated = escalated;
        event
    }

    pub fn stage_abandoned(document_id: &DocumentId, filename: &str, stage: Stage, attempt: u32) -> Self {
        let mut event = Self::new(EventKind::StageAbandoned, Some(document_id), filename);
        event.stage = Some(stage);
        event.attempt = Some(attempt);
        event.outcome = Some(TerminalOutcome::Abandoned);
        event
    }

    pub fn completed(document_id: &DocumentId, filename: &str, outcome: TerminalOutcome) -> Self {
        let mut event = Self::new(EventKind::Completed, Some(document_id), filename);
        event.outcome = Some(outcome);
        event
    }

    pub fn intake_halted(document_id: &DocumentId, filename: &str, error: &str) -> Self {
        let mut event = Self::new(EventKind::IntakeHalted, Some(document_id), filename);
        event.error_kind = Some(ErrorKind::SystemFault);
        event.error = Some(error.to_string());
        event
    }
}

/// Receiver of pipeline events. Called from worker threads.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Discards every event.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: PipelineEvent) {}
}

/// Writes events to the tracing subscriber.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PipelineEvent) {
        let document = event
            .document_id
            .as_ref()
            .map(|id| id.short().to_string())
            .unwrap_or_default();
        let stage = event.stage.map(|s| s.as_str()).unwrap_or("-");

        match event.kind {
            EventKind::StageFailed | EventKind::IngestRejected => tracing::warn!(
                document = %document,
                filename = %event.filename,
                stage,
                attempt = event.attempt,
                error_kind = event.error_kind.map(|k| k.as_str()),
                escalated = event.escalated,
                "{}: {}",
                event.kind,
                event.error.as_deref().unwrap_or("")
            ),
            EventKind::IntakeHalted => tracing::error!(
                document = %document,
                filename = %event.filename,
                "{}: {}",
                event.kind,
                event.error.as_deref().unwrap_or("")
            ),
            EventKind::StageRetrying => tracing::info!(
                document = %document,
                filename = %event.filename,
                stage,
                attempt = event.attempt,
                retry_in_ms = event.retry_in_ms,
                "{}: {}",
                event.kind,
                event.error.as_deref().unwrap_or("")
            ),
            _ => tracing::debug!(
                document = %document,
                filename = %event.filename,
                stage,
                attempt = event.attempt,
                latency_ms = event.latency_ms,
                outcome = ?event.outcome,
                "{}",
                event.kind
            ),
        }
    }
}

/// Broadcasts events to any number of subscribers.
#[derive(Clone)]
pub struct BroadcastSink {
    sender: Arc<broadcast::Sender<PipelineEvent>>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: PipelineEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct CapturingSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<PipelineEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    pub fn for_document(&self, id: &DocumentId) -> Vec<PipelineEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.document_id.as_ref() == Some(id))
            .collect()
    }
}

impl EventSink for CapturingSink {
    fn emit(&self, event: PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Forwards each event to several sinks.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: PipelineEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
