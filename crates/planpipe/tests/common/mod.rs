//! Shared test utilities for planpipe integration tests.
//!
//! This module provides:
//! - Fake collaborators driven by a small line-based plan markup
//! - `PipelineBuilder` / `TestPipeline` for running batches in a temp directory

pub mod builders;
pub mod fakes;

pub use builders::*;
pub use fakes::*;
