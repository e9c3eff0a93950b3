pub mod job;
pub mod pool;
pub mod registry;
pub mod scheduler;

pub use job::{DocumentListener, Submission, WorkItem};
pub use pool::Coordinator;
pub use registry::{Cancellation, Checkout, Registration, Registry};
pub use scheduler::ScheduledRetry;

// Re-export crossbeam_channel for use in the CLI
pub use crossbeam_channel;
