use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlanpipeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to initialise logging: {0}")]
    Telemetry(String),
}

/// Classification of every per-document failure the pipeline can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts and unavailable services. Retried with backoff.
    TransientExternal,
    /// Corrupt, unsupported or unreadable input. The document is rejected.
    InvalidInput,
    /// A fatal normalization rule fired.
    ValidationFailure,
    /// The sink refused the record.
    PersistenceConflict,
    /// Programming or configuration defect. Halts intake.
    SystemFault,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientExternal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TransientExternal => "transient_external",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::ValidationFailure => "validation_failure",
            ErrorKind::PersistenceConflict => "persistence_conflict",
            ErrorKind::SystemFault => "system_fault",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Failed to parse rule file '{path}': {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid pattern in rule '{id}': {reason}")]
    InvalidPattern { id: String, reason: String },

    #[error("Invalid rule '{id}': {reason}")]
    InvalidRule { id: String, reason: String },
}

/// Failure reported by an external collaborator (ingest source, extractor, sink).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExternalError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Unsupported document: {0}")]
    Unsupported(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),
}

impl ExternalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExternalError::InvalidFormat(_) | ExternalError::Unsupported(_) => {
                ErrorKind::InvalidInput
            }
            ExternalError::Unavailable(_) => ErrorKind::TransientExternal,
            ExternalError::ConstraintViolation(_) => ErrorKind::PersistenceConflict,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Intake halted after a system fault: {0}")]
    IntakeHalted(String),

    #[error("Coordinator is shutting down")]
    ShuttingDown,

    #[error("Document {0} is already checked out")]
    AlreadyCheckedOut(String),

    #[error("Unknown document: {0}")]
    UnknownDocument(String),

    #[error("Unknown batch: {0}")]
    UnknownBatch(String),

    #[error("Directory scan failed for '{path}': {source}")]
    ScanFailed {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Input path does not exist: {0}")]
    MissingInput(PathBuf),
}

pub type Result<T> = std::result::Result<T, PlanpipeError>;
