pub mod batch;
pub mod config;
pub mod document;
pub mod error;
pub mod external;
pub mod normalize;
pub mod pipeline;
pub mod sanitize;
pub mod stage;
pub mod telemetry;
pub mod worker;

pub use batch::{BatchController, BatchId, BatchJob, BatchProgress, BatchReport};
pub use config::{load_config, load_rule_set, Config};
pub use document::{DocumentId, DocumentRecord, DocumentStatus, Stage, StageStatus, TerminalOutcome};
pub use error::{ConfigError, ErrorKind, ExternalError, PlanpipeError, Result, StorageError, WorkerError};
pub use normalize::{NormalizationEngine, RuleSet};
pub use pipeline::{EventSink, PipelineConfig, PipelineEvent, RetryPolicy, StageRunner};
pub use stage::{PipelineStage, StageFailure, StageResult, StageSet};
pub use worker::Coordinator;
