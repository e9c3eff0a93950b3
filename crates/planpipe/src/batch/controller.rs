use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::document::{DocumentId, DocumentRecord, DocumentStatus, Stage};
use crate::error::{ErrorKind, WorkerError};
use crate::external::{Extractors, FsIngestSource, IngestSource, RecordSink};
use crate::normalize::NormalizationEngine;
use crate::pipeline::{EventSink, PipelineConfig, PipelineEvent};
use crate::sanitize;
use crate::stage::StageSet;
use crate::worker::{Cancellation, Coordinator, DocumentListener, Submission};

use super::job::{BatchId, BatchJob, BatchProgress, BatchReport};
use super::scanner::DirectoryScanner;

/// Turns a file or directory into a batch of documents on the coordinator.
pub struct BatchController {
    coordinator: Coordinator,
    source: Arc<dyn IngestSource>,
    events: Arc<dyn EventSink>,
    batches: Mutex<HashMap<BatchId, Arc<BatchJob>>>,
}

impl BatchController {
    pub fn new(
        coordinator: Coordinator,
        source: Arc<dyn IngestSource>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            coordinator,
            source,
            events,
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Wires the standard stages and a filesystem ingest source around a new
    /// coordinator.
    pub fn from_config(
        config: &PipelineConfig,
        extractors: Extractors,
        sink: Arc<dyn RecordSink>,
        events: Arc<dyn EventSink>,
    ) -> crate::Result<Self> {
        let engine = NormalizationEngine::new(&config.rule_set, config.allow_warnings)?;
        let stages = StageSet::standard(extractors, Arc::new(engine), sink);
        let coordinator = Coordinator::from_config(config, stages, Arc::clone(&events))?;
        Ok(Self::new(coordinator, Arc::new(FsIngestSource::new()), events))
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    fn batches(&self) -> MutexGuard<'_, HashMap<BatchId, Arc<BatchJob>>> {
        self.batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ingests every PDF under `path` and submits the unique ones as one batch.
    ///
    /// Returns as soon as everything is queued. Sources that cannot be read
    /// are rejected inside the batch rather than failing the call.
    pub fn submit(&self, path: &Path) -> Result<Arc<BatchJob>, WorkerError> {
        let paths = DirectoryScanner::new(path).scan()?;
        let batch = Arc::new(BatchJob::new());
        self.batches().insert(batch.id().clone(), Arc::clone(&batch));
        info!("Batch {}: submitting {} source(s)", batch.id(), paths.len());

        let listener: Arc<dyn DocumentListener> = batch.clone();
        let mut seen: HashSet<DocumentId> = HashSet::new();
        let mut halted: Option<String> = None;

        for source_path in &paths {
            let filename = sanitize::redact_path(source_path);

            if let Some(reason) = &halted {
                batch.reject_source(
                    source_path,
                    Stage::Ingest,
                    ErrorKind::SystemFault,
                    format!("intake halted: {}", reason),
                );
                continue;
            }

            let raw = match self.source.ingest(source_path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Failed to ingest {}: {}", filename, e);
                    self.events.emit(PipelineEvent::ingest_rejected(
                        &filename,
                        e.kind(),
                        &e.to_string(),
                    ));
                    batch.reject_source(source_path, Stage::Ingest, e.kind(), e.to_string());
                    continue;
                }
            };

            let record = DocumentRecord::ingested(source_path, raw);
            let id = record.id().clone();
            if !seen.insert(id.clone()) {
                debug!("{} duplicates {} in this batch", filename, id.short());
                batch.record_duplicate(source_path, id);
                continue;
            }

            batch.add_member(id.clone());
            match self.coordinator.submit(record, Some(Arc::clone(&listener))) {
                Ok(Submission::Accepted(_)) => {}
                Ok(Submission::Duplicate(_)) => {
                    debug!("{} was already ingested as {}", filename, id.short());
                    batch.withdraw_member(&id);
                    batch.record_duplicate(source_path, id);
                }
                Err(WorkerError::IntakeHalted(reason)) => {
                    batch.withdraw_member(&id);
                    batch.reject_source(
                        source_path,
                        Stage::Ingest,
                        ErrorKind::SystemFault,
                        format!("intake halted: {}", reason),
                    );
                    halted = Some(reason);
                }
                Err(e) => {
                    batch.withdraw_member(&id);
                    batch.seal();
                    return Err(e);
                }
            }
        }

        batch.seal();
        Ok(batch)
    }

    pub fn batch(&self, id: &BatchId) -> Option<Arc<BatchJob>> {
        self.batches().get(id).cloned()
    }

    /// Non-blocking progress of a batch.
    pub fn progress(&self, id: &BatchId) -> Option<BatchProgress> {
        self.batch(id).map(|batch| batch.progress())
    }

    pub fn report(&self, id: &BatchId) -> Option<BatchReport> {
        self.batch(id).map(|batch| batch.report())
    }

    pub fn document_status(&self, id: &DocumentId) -> Option<DocumentStatus> {
        self.coordinator.document_status(id)
    }

    /// Cancels every unfinished member. Returns how many were cancelled.
    pub fn cancel_batch(&self, id: &BatchId) -> Result<usize, WorkerError> {
        let batch = self
            .batch(id)
            .ok_or_else(|| WorkerError::UnknownBatch(id.to_string()))?;

        let mut cancelled = 0;
        for member in batch.members() {
            match self.coordinator.cancel_document(&member)? {
                Cancellation::Abandoned(_) | Cancellation::InFlight => cancelled += 1,
                Cancellation::AlreadyTerminal(_) => {}
            }
        }
        info!("Batch {}: cancelled {} document(s)", id, cancelled);
        Ok(cancelled)
    }

    /// Polls until the batch completes or the deadline passes. Returns whether
    /// it completed.
    pub fn wait_for(&self, batch: &BatchJob, poll: Duration, deadline: Option<Instant>) -> bool {
        loop {
            if batch.is_complete() {
                return true;
            }
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                return false;
            }
            thread::sleep(poll);
        }
    }

    /// Stops the coordinator. Unfinished documents are abandoned.
    pub fn shutdown(self) {
        self.coordinator.shutdown();
        self.coordinator.wait();
    }
}
