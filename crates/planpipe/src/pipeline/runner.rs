//! Executes one stage attempt for one document.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info_span, warn};

use crate::document::{
    DocumentRecord, DocumentStatus, FailureReport, Stage, TerminalOutcome,
};
use crate::error::ErrorKind;
use crate::sanitize;
use crate::stage::{StageFailure, StageResult, StageSet};

use super::config::StageTimeouts;
use super::events::{EventSink, PipelineEvent};
use super::retry::{RetryDecision, RetryPolicy};

/// What the coordinator should do with the document after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The stage succeeded; queue this stage next.
    Advance(Stage),
    /// The stage failed transiently; run it again after the delay.
    Retry { stage: Stage, delay: Duration },
    /// The document reached its terminal outcome.
    Finished(TerminalOutcome),
    /// A system fault. The document is rejected and intake must halt.
    Fault(String),
}

/// Receives a status snapshot when an attempt starts, so progress queries
/// can see `Running` while the record is checked out.
pub trait StatusObserver: Send + Sync {
    fn observe(&self, status: DocumentStatus);
}

impl<F> StatusObserver for F
where
    F: Fn(DocumentStatus) + Send + Sync,
{
    fn observe(&self, status: DocumentStatus) {
        self(status)
    }
}

/// Bounds the collaborator calls alive at once. A call that overran its
/// timeout keeps its slot until the collaborator actually returns.
struct CallSlots {
    release: Sender<()>,
    available: Receiver<()>,
}

impl CallSlots {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (release, available) = bounded(capacity);
        for _ in 0..capacity {
            let _ = release.send(());
        }
        Self { release, available }
    }

    fn acquire(&self, timeout: Duration) -> Option<CallSlot> {
        self.available.recv_timeout(timeout).ok().map(|()| CallSlot {
            release: self.release.clone(),
        })
    }
}

struct CallSlot {
    release: Sender<()>,
}

impl Drop for CallSlot {
    fn drop(&mut self) {
        let _ = self.release.try_send(());
    }
}

pub struct StageRunner {
    stages: StageSet,
    policy: RetryPolicy,
    timeouts: StageTimeouts,
    events: Arc<dyn EventSink>,
    slots: CallSlots,
}

impl StageRunner {
    pub fn new(
        stages: StageSet,
        policy: RetryPolicy,
        timeouts: StageTimeouts,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            stages,
            policy,
            timeouts,
            events,
            slots: CallSlots::new(1),
        }
    }

    /// Allows `limit` collaborator calls to be alive at once. A fresh runner
    /// allows one; the coordinator widens it to its worker count.
    pub fn with_call_limit(mut self, limit: usize) -> Self {
        self.slots = CallSlots::new(limit);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs one attempt of `stage` on the owned `record`.
    ///
    /// `cancel` is checked once the collaborator returns; a cancelled
    /// document keeps no result from the attempt.
    pub fn run(
        &self,
        record: &mut DocumentRecord,
        stage: Stage,
        cancel: &AtomicBool,
        observer: &dyn StatusObserver,
    ) -> RunOutcome {
        let filename = sanitize::redact_path(record.source_path());
        let _span = info_span!("stage",
            document = %record.id().short(),
            stage = %stage,
            filename = %filename,
        )
        .entered();

        if let Some(outcome) = record.terminal_outcome() {
            debug!("Document already {}, skipping {}", outcome, stage);
            return RunOutcome::Finished(outcome);
        }

        if cancel.load(Ordering::SeqCst) {
            record.abandon();
            self.events.emit(PipelineEvent::completed(
                record.id(),
                &filename,
                TerminalOutcome::Abandoned,
            ));
            return RunOutcome::Finished(TerminalOutcome::Abandoned);
        }

        let attempt = match record.begin_attempt(stage) {
            Ok(attempt) => attempt,
            Err(e) => return self.fault(record, &filename, stage, 0, Duration::ZERO, e.to_string()),
        };

        observer.observe(record.status());
        self.events.emit(PipelineEvent::stage_started(
            record.id(),
            &filename,
            stage,
            attempt,
        ));

        let started = Instant::now();
        let result = self.execute_with_timeout(record, stage);
        let latency = started.elapsed();

        if cancel.load(Ordering::SeqCst) {
            if let Err(e) = record.abandon_attempt(stage) {
                return self.fault(record, &filename, stage, attempt, latency, e.to_string());
            }
            debug!("Discarded {} result after cancellation", stage);
            self.events.emit(PipelineEvent::stage_abandoned(
                record.id(),
                &filename,
                stage,
                attempt,
            ));
            self.events.emit(PipelineEvent::completed(
                record.id(),
                &filename,
                TerminalOutcome::Abandoned,
            ));
            return RunOutcome::Finished(TerminalOutcome::Abandoned);
        }

        match result {
            StageResult::Success(artifact) => {
                if let Err(e) = record.record_success(stage, artifact) {
                    return self.fault(record, &filename, stage, attempt, latency, e.to_string());
                }
                self.events.emit(PipelineEvent::stage_succeeded(
                    record.id(),
                    &filename,
                    stage,
                    attempt,
                    latency,
                ));

                match stage.next() {
                    Some(next) => RunOutcome::Advance(next),
                    None => {
                        self.events.emit(PipelineEvent::completed(
                            record.id(),
                            &filename,
                            TerminalOutcome::Stored,
                        ));
                        RunOutcome::Finished(TerminalOutcome::Stored)
                    }
                }
            }
            StageResult::Failure(failure) if failure.kind == ErrorKind::SystemFault => {
                self.fault(record, &filename, stage, attempt, latency, failure.message)
            }
            StageResult::Failure(failure) => {
                self.handle_failure(record, &filename, stage, attempt, latency, failure)
            }
        }
    }

    fn handle_failure(
        &self,
        record: &mut DocumentRecord,
        filename: &str,
        stage: Stage,
        attempt: u32,
        latency: Duration,
        mut failure: StageFailure,
    ) -> RunOutcome {
        let escalated = match self.policy.decide(stage, failure.kind, attempt) {
            RetryDecision::RetryAfter(delay) => {
                if let Err(e) = record.mark_retrying(stage) {
                    return self.fault(record, filename, stage, attempt, latency, e.to_string());
                }
                debug!(
                    "Attempt {} of {} failed ({}), retrying in {:?}",
                    attempt, stage, failure, delay
                );
                self.events.emit(PipelineEvent::stage_retrying(
                    record.id(),
                    filename,
                    stage,
                    attempt,
                    latency,
                    failure.kind,
                    &failure.message,
                    delay,
                ));
                return RunOutcome::Retry { stage, delay };
            }
            RetryDecision::Fail => false,
            RetryDecision::Escalate => true,
        };

        let report = FailureReport {
            stage,
            kind: failure.kind,
            message: failure.message.clone(),
            escalated,
        };
        if let Err(e) = record.mark_failed(report) {
            return self.fault(record, filename, stage, attempt, latency, e.to_string());
        }
        if let Some(rejected) = failure.rejected_record.take() {
            record.keep_rejected_record(rejected);
        }

        warn!(
            "Rejected at {} after {} attempt(s): {}",
            stage, attempt, failure
        );
        self.events.emit(PipelineEvent::stage_failed(
            record.id(),
            filename,
            stage,
            attempt,
            latency,
            failure.kind,
            &failure.message,
            escalated,
        ));
        self.events.emit(PipelineEvent::completed(
            record.id(),
            filename,
            TerminalOutcome::Rejected,
        ));
        RunOutcome::Finished(TerminalOutcome::Rejected)
    }

    fn fault(
        &self,
        record: &mut DocumentRecord,
        filename: &str,
        stage: Stage,
        attempt: u32,
        latency: Duration,
        message: String,
    ) -> RunOutcome {
        tracing::error!("System fault in {}: {}", stage, message);
        record.force_reject(FailureReport {
            stage,
            kind: ErrorKind::SystemFault,
            message: message.clone(),
            escalated: false,
        });
        self.events.emit(PipelineEvent::stage_failed(
            record.id(),
            filename,
            stage,
            attempt,
            latency,
            ErrorKind::SystemFault,
            &message,
            false,
        ));
        self.events.emit(PipelineEvent::completed(
            record.id(),
            filename,
            TerminalOutcome::Rejected,
        ));
        RunOutcome::Fault(message)
    }

    /// Runs the stage on a helper thread against a snapshot of the record and
    /// waits at most the stage's timeout. An overrun is a transient failure;
    /// the helper's late result is dropped, but it holds its call slot until
    /// the collaborator returns.
    fn execute_with_timeout(&self, record: &DocumentRecord, stage: Stage) -> StageResult {
        let Some(stage_impl) = self.stages.get(stage).cloned() else {
            return StageResult::Failure(StageFailure::system_fault(format!(
                "no implementation registered for stage {}",
                stage
            )));
        };

        let timeout = self.timeouts.for_stage(stage);
        let Some(slot) = self.slots.acquire(timeout) else {
            debug!("No free call slot for {} within {:?}", stage, timeout);
            return StageResult::Failure(StageFailure::new(
                ErrorKind::TransientExternal,
                format!(
                    "stage {} timed out after {:?} waiting for a free call slot",
                    stage, timeout
                ),
            ));
        };

        let snapshot = record.clone();
        let (tx, rx) = bounded(1);
        let spawned = thread::Builder::new()
            .name(format!("planpipe-{}", stage))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| stage_impl.execute(&snapshot)));
                drop(slot);
                let _ = tx.send(result);
            });
        if let Err(e) = spawned {
            return StageResult::Failure(StageFailure::system_fault(format!(
                "failed to spawn stage thread: {}",
                e
            )));
        }

        match rx.recv_timeout(timeout) {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => StageResult::Failure(StageFailure::system_fault(format!(
                "stage {} panicked: {}",
                stage,
                panic_message(payload.as_ref())
            ))),
            Err(RecvTimeoutError::Timeout) => StageResult::Failure(StageFailure::new(
                ErrorKind::TransientExternal,
                format!("stage {} timed out after {:?}", stage, timeout),
            )),
            Err(RecvTimeoutError::Disconnected) => StageResult::Failure(
                StageFailure::system_fault(format!("stage {} exited without a result", stage)),
            ),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{
        ExtractionArtifact, NormalizedDocument, RawDocument, RecordId, StageArtifact,
        StageStatus,
    };
    use crate::pipeline::events::{CapturingSink, EventKind};
    use crate::stage::PipelineStage;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// Stage whose results are scripted per attempt; the last entry repeats.
    struct Scripted {
        stage: Stage,
        script: Mutex<Vec<Result<(), ErrorKind>>>,
        calls: AtomicU32,
        delay: Duration,
    }

    impl Scripted {
        fn new(stage: Stage, script: Vec<Result<(), ErrorKind>>) -> Arc<Self> {
            Arc::new(Self {
                stage,
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            })
        }

        fn slow(stage: Stage, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                stage,
                script: Mutex::new(vec![Ok(())]),
                calls: AtomicU32::new(0),
                delay,
            })
        }
    }

    impl PipelineStage for Scripted {
        fn stage(&self) -> Stage {
            self.stage
        }

        fn execute(&self, _document: &DocumentRecord) -> StageResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.remove(0)
                } else {
                    script[0]
                }
            };
            match next {
                Ok(()) => StageResult::Success(match self.stage {
                    Stage::Extract => StageArtifact::Extracted(ExtractionArtifact::default()),
                    Stage::Normalize => StageArtifact::Normalized(NormalizedDocument::default()),
                    _ => StageArtifact::Stored(RecordId("r".into())),
                }),
                Err(kind) => StageResult::Failure(StageFailure::new(kind, "scripted")),
            }
        }
    }

    /// Normalization stage that rejects with the record it assembled.
    struct RejectsRecord;

    impl PipelineStage for RejectsRecord {
        fn stage(&self) -> Stage {
            Stage::Normalize
        }

        fn execute(&self, _document: &DocumentRecord) -> StageResult {
            let mut canonical = crate::document::CanonicalRecord::default();
            canonical.validation_errors.push(crate::document::ValidationError {
                rule_id: "dimension-positive".into(),
                field: crate::document::CanonicalField::Dimensions,
                message: "must be positive".into(),
                fatal: true,
            });
            StageResult::Failure(
                StageFailure::new(ErrorKind::ValidationFailure, "dimension-positive")
                    .with_rejected_record(canonical),
            )
        }
    }

    struct Panics;

    impl PipelineStage for Panics {
        fn stage(&self) -> Stage {
            Stage::Extract
        }

        fn execute(&self, _document: &DocumentRecord) -> StageResult {
            panic!("extractor bug")
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

    fn runner(extract: Arc<dyn PipelineStage>, events: Arc<CapturingSink>) -> StageRunner {
        let ok_normalize = Scripted::new(Stage::Normalize, vec![Ok(())]);
        let ok_store = Scripted::new(Stage::Store, vec![Ok(())]);
        StageRunner::new(
            StageSet::new(extract, ok_normalize, ok_store),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                jitter: 0.0,
            },
            StageTimeouts::uniform(Duration::from_secs(5)),
            events,
        )
    }

    fn no_observer() -> impl StatusObserver {
        |_status: DocumentStatus| {}
    }

    #[test]
    fn test_success_advances_to_next_stage() {
        let events = Arc::new(CapturingSink::new());
        let runner = runner(Scripted::new(Stage::Extract, vec![Ok(())]), events.clone());
        let mut record = record();
        let cancel = AtomicBool::new(false);

        let outcome = runner.run(&mut record, Stage::Extract, &cancel, &no_observer());
        assert_eq!(outcome, RunOutcome::Advance(Stage::Normalize));
        assert_eq!(record.stage_status(Stage::Extract), StageStatus::Succeeded);
        assert_eq!(events.of_kind(EventKind::StageStarted).len(), 1);
        assert_eq!(events.of_kind(EventKind::StageSucceeded).len(), 1);
    }

    #[test]
    fn test_full_run_reaches_stored() {
        let events = Arc::new(CapturingSink::new());
        let runner = runner(Scripted::new(Stage::Extract, vec![Ok(())]), events.clone());
        let mut record = record();
        let cancel = AtomicBool::new(false);

        let mut stage = Stage::Extract;
        let outcome = loop {
            match runner.run(&mut record, stage, &cancel, &no_observer()) {
                RunOutcome::Advance(next) => stage = next,
                other => break other,
            }
        };
        assert_eq!(outcome, RunOutcome::Finished(TerminalOutcome::Stored));
        assert!(record.check_invariants().is_ok());
        assert_eq!(events.of_kind(EventKind::Completed).len(), 1);
    }

    #[test]
    fn test_transient_failure_schedules_retry() {
        let events = Arc::new(CapturingSink::new());
        let runner = runner(
            Scripted::new(Stage::Extract, vec![Err(ErrorKind::TransientExternal), Ok(())]),
            events.clone(),
        );
        let mut record = record();
        let cancel = AtomicBool::new(false);

        let outcome = runner.run(&mut record, Stage::Extract, &cancel, &no_observer());
        assert_eq!(
            outcome,
            RunOutcome::Retry {
                stage: Stage::Extract,
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(record.stage_status(Stage::Extract), StageStatus::Retrying);

        let outcome = runner.run(&mut record, Stage::Extract, &cancel, &no_observer());
        assert_eq!(outcome, RunOutcome::Advance(Stage::Normalize));
        assert_eq!(record.attempts(Stage::Extract), 2);
    }

    #[test]
    fn test_retry_budget_escalates() {
        let events = Arc::new(CapturingSink::new());
        let stage = Scripted::new(Stage::Extract, vec![Err(ErrorKind::TransientExternal)]);
        let runner = runner(stage.clone(), events.clone());
        let mut record = record();
        let cancel = AtomicBool::new(false);

        let mut outcome = runner.run(&mut record, Stage::Extract, &cancel, &no_observer());
        while let RunOutcome::Retry { .. } = outcome {
            outcome = runner.run(&mut record, Stage::Extract, &cancel, &no_observer());
        }

        assert_eq!(outcome, RunOutcome::Finished(TerminalOutcome::Rejected));
        assert_eq!(stage.calls.load(Ordering::SeqCst), 3);
        assert_eq!(record.attempts(Stage::Extract), 3);
        let failure = record.failure().unwrap();
        assert!(failure.escalated);
        assert_eq!(failure.kind, ErrorKind::TransientExternal);
        assert!(events.of_kind(EventKind::StageFailed)[0].escalated);
    }

    #[test]
    fn test_non_retryable_failure_rejects_immediately() {
        let events = Arc::new(CapturingSink::new());
        let stage = Scripted::new(Stage::Extract, vec![Err(ErrorKind::InvalidInput)]);
        let runner = runner(stage.clone(), events);
        let mut record = record();

        let outcome = runner.run(&mut record, Stage::Extract, &AtomicBool::new(false), &no_observer());
        assert_eq!(outcome, RunOutcome::Finished(TerminalOutcome::Rejected));
        assert_eq!(stage.calls.load(Ordering::SeqCst), 1);
        assert!(!record.failure().unwrap().escalated);
    }

    #[test]
    fn test_validation_failure_keeps_rejected_record() {
        let events = Arc::new(CapturingSink::new());
        let runner = StageRunner::new(
            StageSet::new(
                Scripted::new(Stage::Extract, vec![Ok(())]),
                Arc::new(RejectsRecord),
                Scripted::new(Stage::Store, vec![Ok(())]),
            ),
            RetryPolicy::default().without_jitter(),
            StageTimeouts::uniform(Duration::from_secs(5)),
            events.clone(),
        );
        let mut record = record();
        let cancel = AtomicBool::new(false);

        let outcome = runner.run(&mut record, Stage::Extract, &cancel, &no_observer());
        assert_eq!(outcome, RunOutcome::Advance(Stage::Normalize));
        let outcome = runner.run(&mut record, Stage::Normalize, &cancel, &no_observer());

        assert_eq!(outcome, RunOutcome::Finished(TerminalOutcome::Rejected));
        assert_eq!(record.failure().unwrap().kind, ErrorKind::ValidationFailure);
        assert_eq!(record.status().validation_errors, vec!["dimension-positive"]);
        assert_eq!(events.of_kind(EventKind::StageFailed).len(), 1);
    }

    #[test]
    fn test_timeout_is_transient() {
        let events = Arc::new(CapturingSink::new());
        let slow = Scripted::slow(Stage::Extract, Duration::from_millis(500));
        let mut runner = runner(slow, events);
        runner.timeouts = StageTimeouts::uniform(Duration::from_millis(20));
        let mut record = record();

        let outcome = runner.run(&mut record, Stage::Extract, &AtomicBool::new(false), &no_observer());
        assert!(matches!(outcome, RunOutcome::Retry { .. }));
        assert_eq!(record.stage_status(Stage::Extract), StageStatus::Retrying);
    }

    #[test]
    fn test_overrunning_call_keeps_its_slot() {
        let events = Arc::new(CapturingSink::new());
        let slow = Scripted::slow(Stage::Extract, Duration::from_millis(300));
        let mut runner = runner(slow.clone(), events.clone());
        runner.timeouts = StageTimeouts::uniform(Duration::from_millis(20));
        let cancel = AtomicBool::new(false);

        let mut first = record();
        let outcome = runner.run(&mut first, Stage::Extract, &cancel, &no_observer());
        assert!(matches!(outcome, RunOutcome::Retry { .. }));

        // The first call is still sleeping and holds the only slot.
        let mut second = record();
        let outcome = runner.run(&mut second, Stage::Extract, &cancel, &no_observer());
        assert!(matches!(outcome, RunOutcome::Retry { .. }));
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
        let retrying = events.of_kind(EventKind::StageRetrying);
        assert!(retrying[1].error.as_deref().unwrap().contains("free call slot"));

        thread::sleep(Duration::from_millis(400));
        let mut third = record();
        runner.timeouts = StageTimeouts::uniform(Duration::from_secs(5));
        let outcome = runner.run(&mut third, Stage::Extract, &cancel, &no_observer());
        assert_eq!(outcome, RunOutcome::Advance(Stage::Normalize));
        assert_eq!(slow.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panic_is_system_fault() {
        let events = Arc::new(CapturingSink::new());
        let runner = runner(Arc::new(Panics), events.clone());
        let mut record = record();

        let outcome = runner.run(&mut record, Stage::Extract, &AtomicBool::new(false), &no_observer());
        match outcome {
            RunOutcome::Fault(message) => assert!(message.contains("extractor bug")),
            other => panic!("Expected fault, got {:?}", other),
        }
        assert_eq!(record.terminal_outcome(), Some(TerminalOutcome::Rejected));
        assert_eq!(record.failure().unwrap().kind, ErrorKind::SystemFault);
    }

    #[test]
    fn test_out_of_order_stage_is_fault() {
        let events = Arc::new(CapturingSink::new());
        let runner = runner(Scripted::new(Stage::Extract, vec![Ok(())]), events);
        let mut record = record();

        let outcome = runner.run(&mut record, Stage::Store, &AtomicBool::new(false), &no_observer());
        assert!(matches!(outcome, RunOutcome::Fault(_)));
    }

    #[test]
    fn test_cancellation_discards_result() {
        let events = Arc::new(CapturingSink::new());
        let runner = runner(Scripted::new(Stage::Extract, vec![Ok(())]), events.clone());
        let mut record = record();
        let cancel = AtomicBool::new(false);

        // Cancel as soon as the attempt is visible as running.
        let observer = |status: DocumentStatus| {
            assert_eq!(status.stage_status(Stage::Extract), StageStatus::Running);
            cancel.store(true, Ordering::SeqCst);
        };
        let outcome = runner.run(&mut record, Stage::Extract, &cancel, &observer);

        assert_eq!(outcome, RunOutcome::Finished(TerminalOutcome::Abandoned));
        assert!(record.extraction().is_none());
        assert_eq!(record.stage_status(Stage::Extract), StageStatus::Pending);
        assert_eq!(events.of_kind(EventKind::StageAbandoned).len(), 1);
    }

    #[test]
    fn test_terminal_document_is_skipped() {
        let events = Arc::new(CapturingSink::new());
        let stage = Scripted::new(Stage::Extract, vec![Ok(())]);
        let runner = runner(stage.clone(), events);
        let mut record = record();
        record.abandon();

        let outcome = runner.run(&mut record, Stage::Extract, &AtomicBool::new(false), &no_observer());
        assert_eq!(outcome, RunOutcome::Finished(TerminalOutcome::Abandoned));
        assert_eq!(stage.calls.load(Ordering::SeqCst), 0);
    }
}
