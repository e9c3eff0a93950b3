//! Stage execution: retry policy, per-attempt runner and event reporting.

pub mod config;
pub mod events;
pub mod retry;
pub mod runner;

pub use config::{PipelineConfig, StageTimeouts};
pub use events::{
    BroadcastSink, CapturingSink, EventKind, EventSink, FanoutSink, NoopSink, PipelineEvent,
    TracingSink,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use runner::{RunOutcome, StageRunner, StatusObserver};
