//! Table of requests awaiting a response, keyed by JSON-RPC id.

use crate::error::McpError;
use crate::jsonrpc::JsonRpcResponse;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

pub(crate) type Reply = Result<JsonRpcResponse, McpError>;

#[derive(Default)]
struct PendingState {
    waiters: HashMap<u64, oneshot::Sender<Reply>>,
    closed: bool,
}

/// Every id leaves the table exactly once: on delivery, when its
/// [`PendingSlot`] is dropped, or through [`PendingRequests::fail_all`].
#[derive(Default)]
pub(crate) struct PendingRequests {
    state: Mutex<PendingState>,
}

/// A registered waiter. Dropping it removes the id if no response was delivered.
pub(crate) struct PendingSlot<'a> {
    table: &'a PendingRequests,
    id: u64,
    pub(crate) rx: oneshot::Receiver<Reply>,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a waiter for `id`. Fails once the table has been closed.
    pub(crate) fn register(&self, id: u64) -> Result<PendingSlot<'_>, McpError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if state.closed {
            return Err(McpError::Closed);
        }
        if state.waiters.contains_key(&id) {
            return Err(McpError::Protocol(format!("request id {id} is already pending")));
        }
        state.waiters.insert(id, tx);
        Ok(PendingSlot {
            table: self,
            id,
            rx,
        })
    }

    /// Deliver a response to its waiter. Returns false when no waiter has its id.
    pub(crate) fn complete(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id else {
            return false;
        };
        let waiter = self.lock().waiters.remove(&id);
        match waiter {
            // The caller may have given up between removal and send; that is fine.
            Some(tx) => {
                let _ = tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        self.lock().waiters.remove(&id).is_some()
    }

    /// Close the table and fail every outstanding waiter. Returns how many were failed.
    pub(crate) fn fail_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.lock();
            state.closed = true;
            state.waiters.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(McpError::Closed));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().waiters.len()
    }
}
