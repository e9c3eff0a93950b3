//! Fake external collaborators.
//!
//! Test plans are written as `%PDF-1.7` followed by markup lines:
//!
//! ```text
//! text: 123 Main St
//! table: Size: 12 ft × 20 ft
//! ner: ADDRESS: 123 Main Street @0.95
//! ```
//!
//! `MarkupExtractor` turns those lines into text spans, table cells and
//! entity spans, so every fake document carries its own extractor output.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use planpipe::document::{
    CanonicalRecord, DocumentId, DocumentRecord, NerSpan, RawDocument, RecordId, Stage,
    TableCell, TextSpan,
};
use planpipe::external::{
    EntityExtractor, Extractors, RecordProvenance, RecordSink, TableExtractor, TextExtractor,
};
use planpipe::stage::{PipelineStage, StageResult};
use planpipe::ExternalError;

const TEXT_CONFIDENCE: f32 = 0.8;
const TABLE_CONFIDENCE: f32 = 0.9;

/// Builds the bytes of a fake plan from markup lines.
pub fn plan_bytes(lines: &[&str]) -> Vec<u8> {
    let mut content = String::from("%PDF-1.7\n");
    for line in lines {
        content.push_str(line);
        content.push('\n');
    }
    content.into_bytes()
}

fn markup_lines(document: &RawDocument) -> Vec<String> {
    String::from_utf8_lossy(&document.bytes)
        .lines()
        .skip(1)
        .map(str::to_string)
        .collect()
}

fn split_confidence(rest: &str, default: f32) -> (String, f32) {
    match rest.rsplit_once(" @") {
        Some((text, confidence)) => (
            text.trim().to_string(),
            confidence.trim().parse().unwrap_or(default),
        ),
        None => (rest.trim().to_string(), default),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MarkupExtractor;

impl MarkupExtractor {
    pub fn extractors() -> Extractors {
        let markup = Arc::new(MarkupExtractor);
        Extractors::text_only(markup.clone())
            .with_tables(markup.clone())
            .with_entities(markup)
    }
}

impl TextExtractor for MarkupExtractor {
    fn extract_text(&self, document: &RawDocument) -> Result<Vec<TextSpan>, ExternalError> {
        Ok(markup_lines(document)
            .iter()
            .enumerate()
            .filter_map(|(i, line)| {
                let rest = line.strip_prefix("text:")?;
                let (text, confidence) = split_confidence(rest, TEXT_CONFIDENCE);
                Some(TextSpan {
                    text,
                    page: 1,
                    line: i as u32 + 1,
                    confidence,
                })
            })
            .collect())
    }
}

impl TableExtractor for MarkupExtractor {
    fn extract_tables(&self, document: &RawDocument) -> Result<Vec<TableCell>, ExternalError> {
        Ok(markup_lines(document)
            .iter()
            .enumerate()
            .filter_map(|(i, line)| {
                let rest = line.strip_prefix("table:")?;
                let (header, cell) = rest.split_once(':')?;
                let (text, confidence) = split_confidence(cell, TABLE_CONFIDENCE);
                Some(TableCell {
                    text,
                    page: 1,
                    row: i as u32 + 1,
                    column: 1,
                    header: Some(header.trim().to_string()),
                    confidence,
                })
            })
            .collect())
    }
}

impl EntityExtractor for MarkupExtractor {
    fn extract_entities(&self, document: &RawDocument) -> Result<Vec<NerSpan>, ExternalError> {
        Ok(markup_lines(document)
            .iter()
            .filter_map(|line| {
                let rest = line.strip_prefix("ner:")?;
                let (label, span) = rest.split_once(':')?;
                let (text, confidence) = split_confidence(span, 0.5);
                Some(NerSpan {
                    label: label.trim().to_string(),
                    end: text.len(),
                    text,
                    start: 0,
                    confidence,
                })
            })
            .collect())
    }
}

/// Text extractor that reports `Unavailable` for its first `failures` calls.
pub struct FlakyText {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyText {
    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Self::failing(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextExtractor for FlakyText {
    fn extract_text(&self, document: &RawDocument) -> Result<Vec<TextSpan>, ExternalError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(ExternalError::Unavailable("text service offline".into()));
        }
        MarkupExtractor.extract_text(document)
    }
}

/// Text extractor that never answers within a short timeout.
pub struct SlowText(pub Duration);

impl TextExtractor for SlowText {
    fn extract_text(&self, document: &RawDocument) -> Result<Vec<TextSpan>, ExternalError> {
        thread::sleep(self.0);
        MarkupExtractor.extract_text(document)
    }
}

/// In-memory record sink.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<HashMap<String, CanonicalRecord>>,
    calls: AtomicUsize,
    conflict: bool,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A sink that refuses every record.
    pub fn conflicting() -> Arc<Self> {
        Arc::new(Self {
            conflict: true,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: &DocumentId) -> Option<CanonicalRecord> {
        self.records.lock().unwrap().get(id.as_str()).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl RecordSink for MemorySink {
    fn persist(
        &self,
        record: &CanonicalRecord,
        provenance: &RecordProvenance,
    ) -> Result<RecordId, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.conflict {
            return Err(ExternalError::ConstraintViolation(
                "unique constraint on address".into(),
            ));
        }
        let id = provenance.document_id.as_str().to_string();
        self.records
            .lock()
            .unwrap()
            .insert(id.clone(), record.clone());
        Ok(RecordId(id))
    }
}

/// Shared bookkeeping for `TrackingStage`.
#[derive(Default)]
pub struct StageTracker {
    active_documents: Mutex<HashSet<DocumentId>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    violations: Mutex<Vec<String>>,
    invocations: AtomicUsize,
}

impl StageTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Calls currently inside a wrapped stage.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn violations(&self) -> Vec<String> {
        self.violations.lock().unwrap().clone()
    }

    fn violation(&self, message: String) {
        self.violations.lock().unwrap().push(message);
    }
}

/// Wraps a stage and checks that no document is ever worked on twice at
/// once and that every snapshot it sees is well ordered.
pub struct TrackingStage {
    inner: Arc<dyn PipelineStage>,
    tracker: Arc<StageTracker>,
    pause: Duration,
}

impl TrackingStage {
    pub fn wrap(
        inner: Arc<dyn PipelineStage>,
        tracker: Arc<StageTracker>,
        pause: Duration,
    ) -> Arc<Self> {
        Arc::new(Self { inner, tracker, pause })
    }
}

impl PipelineStage for TrackingStage {
    fn stage(&self) -> Stage {
        self.inner.stage()
    }

    fn execute(&self, document: &DocumentRecord) -> StageResult {
        let tracker = &self.tracker;
        tracker.invocations.fetch_add(1, Ordering::SeqCst);

        if !tracker
            .active_documents
            .lock()
            .unwrap()
            .insert(document.id().clone())
        {
            tracker.violation(format!("{} entered twice", document.id().short()));
        }
        if let Err(e) = document.check_invariants() {
            tracker.violation(format!("{}: {}", document.id().short(), e));
        }
        if document.running_stage() != Some(self.stage()) {
            tracker.violation(format!(
                "{}: {} ran while {:?} was running",
                document.id().short(),
                self.stage(),
                document.running_stage()
            ));
        }

        let active = tracker.active.fetch_add(1, Ordering::SeqCst) + 1;
        tracker.peak.fetch_max(active, Ordering::SeqCst);

        thread::sleep(self.pause);
        let result = self.inner.execute(document);

        tracker.active.fetch_sub(1, Ordering::SeqCst);
        tracker.active_documents.lock().unwrap().remove(document.id());
        result
    }
}

/// Panics for sources whose file name contains `marker`, once `gate` opens.
/// Other documents pass through to the wrapped stage.
pub struct PanickingStage {
    inner: Arc<dyn PipelineStage>,
    marker: &'static str,
    gate: Arc<AtomicBool>,
}

impl PanickingStage {
    pub fn wrap(
        inner: Arc<dyn PipelineStage>,
        marker: &'static str,
        gate: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner,
            marker,
            gate,
        })
    }
}

impl PipelineStage for PanickingStage {
    fn stage(&self) -> Stage {
        self.inner.stage()
    }

    fn execute(&self, document: &DocumentRecord) -> StageResult {
        let name = document.source_path().to_string_lossy();
        if !name.contains(self.marker) {
            return self.inner.execute(document);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.gate.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        panic!("extractor bug on {}", self.marker)
    }
}
