use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::document::{DocumentId, DocumentRecord, DocumentStatus, TerminalOutcome};
use crate::error::WorkerError;
use crate::pipeline::{EventSink, PipelineConfig, PipelineEvent, RunOutcome, StageRunner};
use crate::sanitize;
use crate::stage::StageSet;
use crate::worker::job::{DocumentListener, Submission, WorkItem};
use crate::worker::registry::{Cancellation, Registration, Registry};
use crate::worker::scheduler::{run_scheduler, ScheduledRetry};

/// State shared by the coordinator handle and its threads.
struct Shared {
    registry: Registry,
    runner: StageRunner,
    events: Arc<dyn EventSink>,
    shutdown: Arc<AtomicBool>,
    halted: Mutex<Option<String>>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl Shared {
    fn halted_reason(&self) -> Option<String> {
        self.halted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn halt(&self, document_id: &DocumentId, filename: &str, reason: &str) {
        let mut halted = self
            .halted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if halted.is_none() {
            error!("Halting intake after system fault: {}", reason);
            *halted = Some(reason.to_string());
            self.events
                .emit(PipelineEvent::intake_halted(document_id, filename, reason));
        }
    }

    fn finished(&self, listener: Option<Arc<dyn DocumentListener>>, status: &DocumentStatus) {
        if let Some(listener) = listener {
            listener.finished(status);
        }
    }
}

/// Runs documents through their stages on a fixed pool of worker threads.
///
/// Work items are `(document, stage)` pairs drained first-in first-out.
/// Each worker runs one stage attempt at a time, so the pool size bounds the
/// number of running attempts. The runner gets one call slot per worker, and
/// a collaborator call that overran its timeout keeps its slot until it
/// returns, so overrunning calls count against the same bound. Delayed
/// retries wait in a scheduler thread and occupy no worker.
pub struct Coordinator {
    shared: Arc<Shared>,
    work_sender: Sender<WorkItem>,
    retry_sender: Sender<ScheduledRetry>,
    workers: Vec<JoinHandle<()>>,
    scheduler: Option<JoinHandle<()>>,
}

impl Coordinator {
    pub fn from_config(
        config: &PipelineConfig,
        stages: StageSet,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, WorkerError> {
        let runner = StageRunner::new(
            stages,
            config.retry.clone(),
            config.timeouts,
            Arc::clone(&events),
        );
        Self::new(config.worker_count, runner, events)
    }

    pub fn new(
        worker_count: usize,
        runner: StageRunner,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, WorkerError> {
        let worker_count = worker_count.max(1);
        let runner = runner.with_call_limit(worker_count);
        let (work_sender, work_receiver) = unbounded::<WorkItem>();
        let (retry_sender, retry_receiver) = unbounded::<ScheduledRetry>();

        let shared = Arc::new(Shared {
            registry: Registry::new(),
            runner,
            events,
            shutdown: Arc::new(AtomicBool::new(false)),
            halted: Mutex::new(None),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let work_rx = work_receiver.clone();
            let work_tx = work_sender.clone();
            let retry_tx = retry_sender.clone();
            let worker_shared = Arc::clone(&shared);

            let handle = thread::Builder::new()
                .name(format!("planpipe-worker-{}", worker_id))
                .spawn(move || run_worker(worker_id, work_rx, work_tx, retry_tx, worker_shared))
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            workers.push(handle);
        }

        let scheduler_tx = work_sender.clone();
        let scheduler_shutdown = Arc::clone(&shared.shutdown);
        let scheduler = thread::Builder::new()
            .name("planpipe-retry".to_string())
            .spawn(move || run_scheduler(retry_receiver, scheduler_tx, scheduler_shutdown))
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;

        info!("Started {} workers", worker_count);

        Ok(Self {
            shared,
            work_sender,
            retry_sender,
            workers,
            scheduler: Some(scheduler),
        })
    }

    /// Registers an ingested record and queues its next stage.
    ///
    /// A record whose content hash is already registered is not queued again.
    pub fn submit(
        &self,
        record: DocumentRecord,
        listener: Option<Arc<dyn DocumentListener>>,
    ) -> Result<Submission, WorkerError> {
        if self.shared.shutdown.load(Ordering::Relaxed) {
            return Err(WorkerError::ShuttingDown);
        }
        if let Some(reason) = self.shared.halted_reason() {
            return Err(WorkerError::IntakeHalted(reason));
        }

        let id = record.id().clone();
        let filename = sanitize::redact_path(record.source_path());
        let next_stage = record.next_stage();

        if let Registration::Duplicate(status) = self.shared.registry.register(record, listener)
        {
            debug!("Document {} already registered", id.short());
            return Ok(Submission::Duplicate(status));
        }
        self.shared
            .events
            .emit(PipelineEvent::ingested(&id, &filename));

        if let Some(stage) = next_stage {
            self.work_sender
                .send(WorkItem::new(id.clone(), stage))
                .map_err(|_| WorkerError::ChannelClosed)?;
        }
        Ok(Submission::Accepted(id))
    }

    /// Cancels one document. An idle document is abandoned immediately; a
    /// running one is abandoned when its attempt returns.
    pub fn cancel_document(&self, id: &DocumentId) -> Result<Cancellation, WorkerError> {
        let cancellation = self.shared.registry.cancel(id)?;
        if let Cancellation::Abandoned(status) = &cancellation {
            debug!("Cancelled idle document {}", id.short());
            let filename = sanitize::redact_path(&status.source_path);
            self.shared.events.emit(PipelineEvent::completed(
                id,
                &filename,
                TerminalOutcome::Abandoned,
            ));
            self.shared
                .finished(self.shared.registry.listener(id), status);
        }
        Ok(cancellation)
    }

    pub fn document_status(&self, id: &DocumentId) -> Option<DocumentStatus> {
        self.shared.registry.status(id)
    }

    /// The reason intake stopped, if a system fault occurred.
    pub fn halted(&self) -> Option<String> {
        self.shared.halted_reason()
    }

    /// Number of stage attempts running right now.
    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Highest number of attempts that ran at the same time.
    pub fn peak_running(&self) -> usize {
        self.shared.peak_running.load(Ordering::SeqCst)
    }

    /// Documents registered and not yet terminal.
    pub fn live_documents(&self) -> usize {
        self.shared.registry.live_count()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn shutdown(&self) {
        info!("Shutting down coordinator...");
        self.shared.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Relaxed)
    }

    /// Stops the threads and abandons every document that did not finish.
    pub fn wait(mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        drop(self.work_sender);
        drop(self.retry_sender);

        for (i, worker) in self.workers.drain(..).enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }
        if let Some(scheduler) = self.scheduler.take() {
            if let Err(e) = scheduler.join() {
                error!("Retry scheduler panicked: {:?}", e);
            }
        }

        let abandoned = self.shared.registry.abandon_idle();
        if !abandoned.is_empty() {
            warn!("Abandoned {} unfinished document(s)", abandoned.len());
        }
        for (status, listener) in abandoned {
            let filename = sanitize::redact_path(&status.source_path);
            self.shared.events.emit(PipelineEvent::completed(
                &status.id,
                &filename,
                TerminalOutcome::Abandoned,
            ));
            self.shared.finished(listener, &status);
        }

        info!("All workers have stopped");
    }
}

fn run_worker(
    worker_id: usize,
    work_receiver: Receiver<WorkItem>,
    work_sender: Sender<WorkItem>,
    retry_sender: Sender<ScheduledRetry>,
    shared: Arc<Shared>,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match work_receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(item) => {
                debug!("Worker {} processing {}", worker_id, item);
                if let Err(e) = process(&shared, item, &work_sender, &retry_sender) {
                    error!("Worker {} failed to queue follow-up work: {}", worker_id, e);
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Worker {} work channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

fn process(
    shared: &Shared,
    item: WorkItem,
    work_sender: &Sender<WorkItem>,
    retry_sender: &Sender<ScheduledRetry>,
) -> Result<(), WorkerError> {
    let checkout = match shared.registry.checkout(&item.document_id) {
        Ok(checkout) => checkout,
        Err(e) => {
            let filename = shared
                .registry
                .status(&item.document_id)
                .map(|status| sanitize::redact_path(&status.source_path))
                .unwrap_or_default();
            shared.halt(&item.document_id, &filename, &e.to_string());
            return Ok(());
        }
    };
    let mut record = checkout.record;

    // Cancelled while queued or waiting for a retry.
    if record.is_terminal() {
        debug!("Skipping {}: document already finished", item);
        shared.registry.checkin(record);
        return Ok(());
    }

    let running = shared.running.fetch_add(1, Ordering::SeqCst) + 1;
    shared.peak_running.fetch_max(running, Ordering::SeqCst);

    let observer = |status: DocumentStatus| {
        if let Some(listener) = shared.registry.mark_running(status) {
            listener.started(&item.document_id);
        }
    };
    let outcome = shared
        .runner
        .run(&mut record, item.stage, &checkout.cancel, &observer);

    shared.running.fetch_sub(1, Ordering::SeqCst);

    match outcome {
        RunOutcome::Advance(next) => {
            shared.registry.checkin(record);
            work_sender
                .send(WorkItem::new(item.document_id, next))
                .map_err(|_| WorkerError::ChannelClosed)?;
        }
        RunOutcome::Retry { stage, delay } => {
            shared.registry.checkin(record);
            retry_sender
                .send(ScheduledRetry::after(
                    delay,
                    WorkItem::new(item.document_id, stage),
                ))
                .map_err(|_| WorkerError::ChannelClosed)?;
        }
        RunOutcome::Finished(outcome) => {
            debug!("Document {} finished: {}", item.document_id.short(), outcome);
            let status = record.status();
            let listener = shared.registry.checkin(record);
            shared.finished(listener, &status);
        }
        RunOutcome::Fault(reason) => {
            let status = record.status();
            let filename = sanitize::redact_path(record.source_path());
            let listener = shared.registry.checkin(record);
            shared.finished(listener, &status);
            shared.halt(&item.document_id, &filename, &reason);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{RawDocument, Stage, StageArtifact};
    use crate::document::{ExtractionArtifact, NormalizedDocument, RecordId};
    use crate::pipeline::{CapturingSink, EventKind, RetryPolicy, StageTimeouts};
    use crate::stage::{PipelineStage, StageResult};
    use std::time::Instant;

    struct Succeed(Stage);

    impl PipelineStage for Succeed {
        fn stage(&self) -> Stage {
            self.0
        }

        fn execute(&self, _document: &DocumentRecord) -> StageResult {
            StageResult::Success(match self.0 {
                Stage::Extract => StageArtifact::Extracted(ExtractionArtifact::default()),
                Stage::Normalize => StageArtifact::Normalized(NormalizedDocument::default()),
                _ => StageArtifact::Stored(RecordId("stored".into())),
            })
        }
    }

    fn coordinator(workers: usize, events: Arc<CapturingSink>) -> Coordinator {
        let stages = StageSet::new(
            Arc::new(Succeed(Stage::Extract)),
            Arc::new(Succeed(Stage::Normalize)),
            Arc::new(Succeed(Stage::Store)),
        );
        let runner = StageRunner::new(
            stages,
            RetryPolicy::default().without_jitter(),
            StageTimeouts::uniform(Duration::from_secs(5)),
            events.clone(),
        );
        Coordinator::new(workers, runner, events).unwrap()
    }

    fn record(hash: &str) -> DocumentRecord {
        DocumentRecord::ingested(
            format!("/plans/{}.pdf", hash),
            RawDocument {
                bytes: Arc::from(b"%PDF-1.7".to_vec()),
                content_hash: hash.to_string(),
                mime_type: None,
            },
        )
    }

    fn wait_until_idle(coordinator: &Coordinator) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while coordinator.live_documents() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_coordinator_creation() {
        let coordinator = coordinator(2, Arc::new(CapturingSink::new()));
        assert_eq!(coordinator.worker_count(), 2);
        assert!(!coordinator.is_shutdown());

        coordinator.shutdown();
        assert!(coordinator.is_shutdown());
        assert!(matches!(
            coordinator.submit(record("a"), None),
            Err(WorkerError::ShuttingDown)
        ));
        coordinator.wait();
    }

    #[test]
    fn test_document_runs_to_stored() {
        let events = Arc::new(CapturingSink::new());
        let coordinator = coordinator(2, events.clone());

        let submission = coordinator.submit(record("a"), None).unwrap();
        let id = match submission {
            Submission::Accepted(id) => id,
            other => panic!("Expected acceptance, got {:?}", other),
        };
        wait_until_idle(&coordinator);

        let status = coordinator.document_status(&id).unwrap();
        assert_eq!(status.terminal_outcome, Some(TerminalOutcome::Stored));
        assert_eq!(events.of_kind(EventKind::Ingested).len(), 1);
        assert_eq!(events.of_kind(EventKind::StageSucceeded).len(), 3);
        coordinator.wait();
    }

    #[test]
    fn test_duplicate_submission_is_not_queued() {
        let events = Arc::new(CapturingSink::new());
        let coordinator = coordinator(1, events.clone());

        coordinator.submit(record("a"), None).unwrap();
        let second = coordinator.submit(record("a"), None).unwrap();
        assert!(matches!(second, Submission::Duplicate(_)));
        wait_until_idle(&coordinator);

        assert_eq!(events.of_kind(EventKind::Ingested).len(), 1);
        assert_eq!(events.of_kind(EventKind::Completed).len(), 1);
        coordinator.wait();
    }

    #[test]
    fn test_wait_abandons_unfinished_documents() {
        let events = Arc::new(CapturingSink::new());
        let coordinator = coordinator(1, events.clone());
        coordinator.shutdown();
        // Register directly so the document is never picked up.
        coordinator.shared.registry.register(record("a"), None);
        let id = DocumentId::from_content_hash("a");
        let shared = Arc::clone(&coordinator.shared);

        coordinator.wait();
        assert_eq!(
            shared.registry.status(&id).unwrap().terminal_outcome,
            Some(TerminalOutcome::Abandoned)
        );
        assert_eq!(events.of_kind(EventKind::Completed).len(), 1);
    }
}
