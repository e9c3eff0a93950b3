//! Holds delayed retries until they are due, then queues them for a worker.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error};

use super::job::WorkItem;

const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct ScheduledRetry {
    pub due: Instant,
    pub item: WorkItem,
}

impl ScheduledRetry {
    pub fn after(delay: Duration, item: WorkItem) -> Self {
        Self {
            due: Instant::now() + delay,
            item,
        }
    }
}

struct Pending {
    due: Instant,
    sequence: u64,
    item: WorkItem,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// Reversed: the earliest due time sits on top of the max-heap.
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Runs until shutdown, or until the intake channel closes with nothing left
/// to release. Retries still pending at shutdown are dropped.
pub fn run_scheduler(
    retries: Receiver<ScheduledRetry>,
    work_sender: Sender<WorkItem>,
    shutdown: Arc<AtomicBool>,
) {
    debug!("Retry scheduler started");

    let mut heap: BinaryHeap<Pending> = BinaryHeap::new();
    let mut sequence = 0u64;
    let mut intake_open = true;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Retry scheduler received shutdown signal");
            break;
        }

        let now = Instant::now();
        while heap.peek().map(|p| p.due <= now).unwrap_or(false) {
            if let Some(pending) = heap.pop() {
                debug!("Releasing retry {}", pending.item);
                if work_sender.send(pending.item).is_err() {
                    error!("Work queue closed, dropping pending retries");
                    return;
                }
            }
        }

        let wait = heap
            .peek()
            .map(|p| p.due.saturating_duration_since(now))
            .unwrap_or(IDLE_POLL)
            .min(IDLE_POLL);

        if !intake_open {
            if heap.is_empty() {
                break;
            }
            thread::sleep(wait);
            continue;
        }

        match retries.recv_timeout(wait) {
            Ok(retry) => {
                heap.push(Pending {
                    due: retry.due,
                    sequence,
                    item: retry.item,
                });
                sequence += 1;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => intake_open = false,
        }
    }

    debug!("Retry scheduler stopped with {} pending", heap.len());
}
