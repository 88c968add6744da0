//! crates/verse_study_core/src/dispatcher.rs
//!
//! Fire-and-forget writes. Callers hand a mutation to the `WriteDispatcher`
//! and carry on; the outcome is never returned to the call site. Failures are
//! logged and published on the process-wide `ErrorChannel`, and nothing that
//! the caller applied optimistically is rolled back.
//!
//! Code that needs confirmation must follow up with its own awaited read.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::ports::{DocumentStore, PortError};
use crate::store::{DocPath, WriteMode};

const ERROR_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    Merge,
    Replace,
    Delete,
}

impl From<WriteMode> for WriteKind {
    fn from(mode: WriteMode) -> Self {
        match mode {
            WriteMode::Merge => WriteKind::Merge,
            WriteMode::Replace => WriteKind::Replace,
        }
    }
}

/// A write that the store rejected after the caller moved on.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteFailure {
    pub path: DocPath,
    pub kind: WriteKind,
    pub error: PortError,
}

/// The observable channel that carries every out-of-band write failure.
#[derive(Clone)]
pub struct ErrorChannel {
    tx: broadcast::Sender<WriteFailure>,
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(ERROR_BUFFER);
        Self { tx }
    }

    pub fn emit(&self, failure: WriteFailure) {
        // Nobody listening is fine; the failure has already been logged.
        let _ = self.tx.send(failure);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WriteFailure> {
        self.tx.subscribe()
    }
}

#[derive(Clone)]
pub struct WriteDispatcher {
    store: Arc<dyn DocumentStore>,
    errors: ErrorChannel,
    in_flight: TaskTracker,
}

impl WriteDispatcher {
    pub fn new(store: Arc<dyn DocumentStore>, errors: ErrorChannel) -> Self {
        Self {
            store,
            errors,
            in_flight: TaskTracker::new(),
        }
    }

    /// Dispatches a set (merge or replace) without waiting for it.
    pub fn set(&self, path: DocPath, data: Value, mode: WriteMode) {
        let store = self.store.clone();
        let errors = self.errors.clone();
        debug!(%path, ?mode, "Dispatching write.");
        self.in_flight.spawn(async move {
            if let Err(e) = store.set(&path, data, mode).await {
                error!(%path, error = %e, "Non-blocking write failed.");
                errors.emit(WriteFailure {
                    path,
                    kind: mode.into(),
                    error: e,
                });
            }
        });
    }

    /// Dispatches several sets that must land in the given order. A failure
    /// is reported and stops the remaining writes.
    pub fn set_in_order(&self, writes: Vec<(DocPath, Value, WriteMode)>) {
        let store = self.store.clone();
        let errors = self.errors.clone();
        debug!(count = writes.len(), "Dispatching ordered writes.");
        self.in_flight.spawn(async move {
            for (path, data, mode) in writes {
                if let Err(e) = store.set(&path, data, mode).await {
                    error!(%path, error = %e, "Non-blocking write failed; skipping the rest.");
                    errors.emit(WriteFailure {
                        path,
                        kind: mode.into(),
                        error: e,
                    });
                    return;
                }
            }
        });
    }

    /// Dispatches a delete without waiting for it.
    pub fn delete(&self, path: DocPath) {
        let store = self.store.clone();
        let errors = self.errors.clone();
        debug!(%path, "Dispatching delete.");
        self.in_flight.spawn(async move {
            if let Err(e) = store.delete(&path).await {
                error!(%path, error = %e, "Non-blocking delete failed.");
                errors.emit(WriteFailure {
                    path,
                    kind: WriteKind::Delete,
                    error: e,
                });
            }
        });
    }

    /// Number of writes that have been dispatched but not finished.
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    /// Waits for every write dispatched so far to finish. Writes are never
    /// cancelled; this is how shutdown lets them drain.
    pub async fn settle(&self) {
        self.in_flight.close();
        self.in_flight.wait().await;
        self.in_flight.reopen();
    }
}
