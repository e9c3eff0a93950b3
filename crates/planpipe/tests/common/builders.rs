//! Builders for rule sets and fully wired test pipelines.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use planpipe::batch::{BatchController, BatchJob, BatchReport};
use planpipe::document::{CanonicalField, DocumentId, DocumentStatus, ExtractorKind, Stage};
use planpipe::external::{content_hash, Extractors, FsIngestSource, RecordSink};
use planpipe::normalize::{
    Check, NormalizationEngine, NormalizationRule, RuleSet, SourceMatcher, ValidationRule,
};
use planpipe::pipeline::{CapturingSink, RetryPolicy, StageRunner, StageTimeouts};
use planpipe::stage::{PipelineStage, StageSet};
use planpipe::worker::Coordinator;

use super::fakes::{MarkupExtractor, MemorySink};

pub fn rule(
    id: &str,
    field: CanonicalField,
    priority: i32,
    extractor: ExtractorKind,
    label: Option<&str>,
    pattern: Option<&str>,
) -> NormalizationRule {
    NormalizationRule {
        id: id.to_string(),
        field,
        priority,
        source: SourceMatcher {
            extractor,
            label: label.map(str::to_string),
            pattern: pattern.map(str::to_string),
        },
        transform: None,
    }
}

/// Address from text or NER (NER preferred), dimensions from text or the
/// "Size" table column, and a fatal positivity check on dimensions.
pub fn plan_rules() -> RuleSet {
    RuleSet {
        rules: vec![
            rule(
                "address-text",
                CanonicalField::Address,
                1,
                ExtractorKind::Text,
                None,
                Some(r"(?P<value>\d+ \w+ (St|Street|Ave|Avenue))\b"),
            ),
            rule(
                "address-ner",
                CanonicalField::Address,
                5,
                ExtractorKind::Entity,
                Some("^ADDRESS$"),
                None,
            ),
            rule(
                "dimensions-table",
                CanonicalField::Dimensions,
                2,
                ExtractorKind::Table,
                Some("(?i)^size$"),
                None,
            ),
            rule(
                "dimensions-text",
                CanonicalField::Dimensions,
                1,
                ExtractorKind::Text,
                None,
                Some(r"(?i)dimensions?:\s*(?P<value>.+)"),
            ),
        ],
        validations: vec![ValidationRule {
            id: "dimension-positive".to_string(),
            field: CanonicalField::Dimensions,
            check: Check::Positive,
            fatal: true,
            message: None,
        }],
    }
}

/// Millisecond backoff without jitter so retries finish quickly.
pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        jitter: 0.0,
    }
}

type StageWrapper = Box<dyn Fn(Arc<dyn PipelineStage>) -> Arc<dyn PipelineStage>>;

pub struct PipelineBuilder {
    workers: usize,
    extractors: Extractors,
    rules: RuleSet,
    allow_warnings: bool,
    policy: RetryPolicy,
    timeouts: StageTimeouts,
    sink: Arc<MemorySink>,
    wrapper: Option<StageWrapper>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            workers: 2,
            extractors: MarkupExtractor::extractors(),
            rules: plan_rules(),
            allow_warnings: true,
            policy: fast_policy(3),
            timeouts: StageTimeouts::uniform(Duration::from_secs(10)),
            sink: MemorySink::new(),
            wrapper: None,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn extractors(mut self, extractors: Extractors) -> Self {
        self.extractors = extractors;
        self
    }

    pub fn rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn allow_warnings(mut self, allow: bool) -> Self {
        self.allow_warnings = allow;
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn sink(mut self, sink: Arc<MemorySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Wraps every stage, e.g. with a `TrackingStage`.
    pub fn wrap_stages<F>(mut self, wrapper: F) -> Self
    where
        F: Fn(Arc<dyn PipelineStage>) -> Arc<dyn PipelineStage> + 'static,
    {
        self.wrapper = Some(Box::new(wrapper));
        self
    }

    pub fn build(self) -> TestPipeline {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let input_dir = temp_dir.path().join("input");
        std::fs::create_dir_all(&input_dir).expect("Failed to create input directory");

        let engine = NormalizationEngine::new(&self.rules, self.allow_warnings)
            .expect("Test rules should compile");
        let sink: Arc<dyn RecordSink> = self.sink.clone();
        let mut stages = StageSet::standard(self.extractors, Arc::new(engine), sink);
        if let Some(wrap) = &self.wrapper {
            let get = |stage| Arc::clone(stages.get(stage).expect("stage is registered"));
            stages = StageSet::new(
                wrap(get(Stage::Extract)),
                wrap(get(Stage::Normalize)),
                wrap(get(Stage::Store)),
            );
        }

        let events = Arc::new(CapturingSink::new());
        let runner = StageRunner::new(stages, self.policy, self.timeouts, events.clone());
        let coordinator =
            Coordinator::new(self.workers, runner, events.clone()).expect("Failed to start workers");
        let controller =
            BatchController::new(coordinator, Arc::new(FsIngestSource::new()), events.clone());

        TestPipeline {
            temp_dir,
            input_dir,
            controller,
            events,
            sink: self.sink,
        }
    }
}

/// A running pipeline over a temporary input directory.
pub struct TestPipeline {
    temp_dir: TempDir,
    pub input_dir: PathBuf,
    pub controller: BatchController,
    pub events: Arc<CapturingSink>,
    pub sink: Arc<MemorySink>,
}

impl TestPipeline {
    /// Writes a fake plan and returns its path and expected document id.
    pub fn write_plan(&self, name: &str, lines: &[&str]) -> (PathBuf, DocumentId) {
        let bytes = super::fakes::plan_bytes(lines);
        let path = self.input_dir.join(name);
        std::fs::write(&path, &bytes).expect("Failed to write plan");
        (path, DocumentId::from_content_hash(content_hash(&bytes)))
    }

    pub fn write_raw(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.input_dir.join(name);
        std::fs::write(&path, bytes).expect("Failed to write file");
        path
    }

    pub fn base_dir(&self) -> &std::path::Path {
        self.temp_dir.path()
    }

    /// Submits `path` and waits for the batch to complete.
    pub fn run(&self, path: &std::path::Path) -> (Arc<BatchJob>, BatchReport) {
        let batch = self.controller.submit(path).expect("Submission failed");
        let completed = self.controller.wait_for(
            &batch,
            Duration::from_millis(5),
            Some(Instant::now() + Duration::from_secs(20)),
        );
        assert!(completed, "Batch did not complete: {:?}", batch.progress());
        let report = batch.report();
        (batch, report)
    }

    pub fn run_dir(&self) -> (Arc<BatchJob>, BatchReport) {
        let dir = self.input_dir.clone();
        self.run(&dir)
    }

    pub fn status(&self, id: &DocumentId) -> DocumentStatus {
        self.controller
            .document_status(id)
            .expect("Document should be registered")
    }

    pub fn shutdown(self) {
        self.controller.shutdown();
    }
}
