//! Batch submission and aggregate progress.

pub mod controller;
pub mod job;
pub mod scanner;

pub use controller::BatchController;
pub use job::{BatchId, BatchJob, BatchProgress, BatchReport, DuplicateEntry, RejectionEntry};
pub use scanner::DirectoryScanner;
