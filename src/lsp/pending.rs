//! Outstanding request bookkeeping
//!
//! Every resolution path (response, timeout, shutdown, caller drop) goes
//! through [`PendingTable::take`] under the same lock, and the result is
//! delivered inside that critical section. Whichever path removes the entry
//! first is the only one that resolves it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::lsp::error::RpcError;

/// Final outcome delivered to a waiting caller
pub type RequestOutcome = Result<Value, RpcError>;

/// A request waiting for its response
#[derive(Debug)]
pub struct PendingRequest {
    method: String,
    deadline: Instant,
    responder: oneshot::Sender<RequestOutcome>,
}

#[derive(Debug, Default)]
struct PendingState {
    entries: HashMap<u64, PendingRequest>,
    closed: bool,
}

/// Pending requests keyed by id, owned by one session
#[derive(Debug, Default)]
pub struct PendingTable {
    state: Mutex<PendingState>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new outstanding request and hand back its result slot
    pub fn register(
        &self,
        id: u64,
        method: &str,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<RequestOutcome>, RpcError> {
        let mut state = self.lock();
        if state.closed {
            return Err(RpcError::Cancelled);
        }
        if state.entries.contains_key(&id) {
            return Err(RpcError::DuplicateRequestId(id));
        }

        let (responder, receiver) = oneshot::channel();
        state.entries.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                deadline,
                responder,
            },
        );
        trace!("PendingTable: registered request {} ({})", id, method);
        Ok(receiver)
    }

    /// Resolve a request with its outcome
    ///
    /// Returns false when the id is unknown (already resolved, timed out, or
    /// never issued); the outcome is dropped in that case.
    pub fn resolve(&self, id: u64, outcome: RequestOutcome) -> bool {
        let mut state = self.lock();
        match state.entries.remove(&id) {
            Some(pending) => {
                trace!("PendingTable: resolving request {} ({})", id, pending.method);
                if pending.responder.send(outcome).is_err() {
                    debug!("Response receiver dropped for request {}", id);
                }
                true
            }
            None => false,
        }
    }

    /// Remove a request without delivering anything
    ///
    /// Used by the waiting caller itself (timeout, drop). Returns true if
    /// this call won the race to remove the entry.
    pub fn take(&self, id: u64) -> bool {
        self.lock().entries.remove(&id).is_some()
    }

    /// Reject every outstanding request with `Cancelled` and refuse new ones
    pub fn cancel_all(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let count = state.entries.len();
        let now = Instant::now();
        for (id, pending) in state.entries.drain() {
            debug!(
                "Cancelling pending request {} ({}), {:?} before its deadline",
                id,
                pending.method,
                pending.deadline.saturating_duration_since(now)
            );
            let _ = pending.responder.send(Err(RpcError::Cancelled));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().entries.contains_key(&id)
    }

}

/// Unregisters a pending entry if the waiting future is dropped early
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: u64,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(table: &'a PendingTable, id: u64) -> Self {
        Self {
            table,
            id,
            armed: true,
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.table.take(self.id) {
            debug!("Dropped waiter for request {}, entry removed", self.id);
        }
    }
}
