//! Owner of every registered document record.
//!
//! A worker checks a record out before running a stage and checks it back in
//! afterwards. While a record is out, the registry keeps only its last status
//! snapshot, so progress queries never wait on a running stage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::document::{DocumentId, DocumentRecord, DocumentStatus, TerminalOutcome};
use crate::error::WorkerError;

use super::job::DocumentListener;

struct Entry {
    record: Option<DocumentRecord>,
    status: DocumentStatus,
    cancel: Arc<AtomicBool>,
    listener: Option<Arc<dyn DocumentListener>>,
    started: bool,
}

/// A record taken out of the registry, with its cancellation flag.
pub struct Checkout {
    pub record: DocumentRecord,
    pub cancel: Arc<AtomicBool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Registered,
    Duplicate(DocumentStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cancellation {
    /// The document was idle and is now abandoned.
    Abandoned(DocumentStatus),
    /// An attempt is running; its result will be discarded.
    InFlight,
    /// The document already had an outcome.
    AlreadyTerminal(TerminalOutcome),
}

#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<DocumentId, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DocumentId, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(
        &self,
        record: DocumentRecord,
        listener: Option<Arc<dyn DocumentListener>>,
    ) -> Registration {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(record.id()) {
            return Registration::Duplicate(existing.status.clone());
        }

        let entry = Entry {
            status: record.status(),
            record: Some(record),
            cancel: Arc::new(AtomicBool::new(false)),
            listener,
            started: false,
        };
        entries.insert(entry.status.id.clone(), entry);
        Registration::Registered
    }

    /// Takes exclusive ownership of a record. Refused while another worker
    /// holds it.
    pub fn checkout(&self, id: &DocumentId) -> Result<Checkout, WorkerError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| WorkerError::UnknownDocument(id.to_string()))?;
        let record = entry
            .record
            .take()
            .ok_or_else(|| WorkerError::AlreadyCheckedOut(id.to_string()))?;
        Ok(Checkout {
            record,
            cancel: Arc::clone(&entry.cancel),
        })
    }

    /// Returns a record and refreshes its status. Yields the document's
    /// listener when the record is terminal.
    pub fn checkin(&self, record: DocumentRecord) -> Option<Arc<dyn DocumentListener>> {
        let mut entries = self.lock();
        let entry = entries.get_mut(record.id())?;
        entry.status = record.status();
        let listener = if record.is_terminal() {
            entry.listener.clone()
        } else {
            None
        };
        entry.record = Some(record);
        listener
    }

    /// Mirrors the status of a checked-out record. Yields the listener on the
    /// document's first attempt.
    pub fn mark_running(&self, status: DocumentStatus) -> Option<Arc<dyn DocumentListener>> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&status.id)?;
        entry.status = status;
        if entry.started {
            return None;
        }
        entry.started = true;
        entry.listener.clone()
    }

    pub fn status(&self, id: &DocumentId) -> Option<DocumentStatus> {
        self.lock().get(id).map(|entry| entry.status.clone())
    }

    pub fn listener(&self, id: &DocumentId) -> Option<Arc<dyn DocumentListener>> {
        self.lock().get(id).and_then(|entry| entry.listener.clone())
    }

    pub fn is_checked_out(&self, id: &DocumentId) -> bool {
        self.lock()
            .get(id)
            .map(|entry| entry.record.is_none())
            .unwrap_or(false)
    }

    /// Requests cancellation. Idle documents are abandoned on the spot;
    /// running ones see the flag when their attempt returns.
    pub fn cancel(&self, id: &DocumentId) -> Result<Cancellation, WorkerError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| WorkerError::UnknownDocument(id.to_string()))?;

        if let Some(outcome) = entry.status.terminal_outcome {
            return Ok(Cancellation::AlreadyTerminal(outcome));
        }
        entry.cancel.store(true, Ordering::SeqCst);

        match entry.record.as_mut() {
            Some(record) => {
                record.abandon();
                entry.status = record.status();
                Ok(Cancellation::Abandoned(entry.status.clone()))
            }
            None => Ok(Cancellation::InFlight),
        }
    }

    /// Abandons every idle document that has no outcome yet. Used once the
    /// workers have stopped.
    pub fn abandon_idle(&self) -> Vec<(DocumentStatus, Option<Arc<dyn DocumentListener>>)> {
        let mut entries = self.lock();
        let mut abandoned = Vec::new();
        for entry in entries.values_mut() {
            if let Some(record) = entry.record.as_mut() {
                if record.abandon() {
                    entry.status = record.status();
                    abandoned.push((entry.status.clone(), entry.listener.clone()));
                }
            }
        }
        abandoned
    }

    /// Number of documents without a terminal outcome.
    pub fn live_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|entry| entry.status.terminal_outcome.is_none())
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
