//! Pending requests tracker
//!
//! Tracks requests forwarded to a client and routes each reply back to the
//! caller waiting on it. A waiter is removed exactly once: by its reply, by
//! cancellation, or by a session-wide failure.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;
use tunlify_proto::RequestId;

use crate::error::RelayError;
use crate::multiplexer::ForwardedResponse;

/// Outcome delivered to a waiting caller
pub type Reply = Result<ForwardedResponse, RelayError>;

/// Tracks forwarded requests awaiting a client reply
#[derive(Clone)]
pub struct PendingRequests {
    /// Maps request id -> oneshot sender for the outcome
    requests: Arc<DashMap<RequestId, oneshot::Sender<Reply>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
        }
    }

    /// Register a new pending request
    /// Returns a receiver that will receive the outcome
    pub fn register(&self, id: RequestId) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.requests.insert(id, tx);
        debug!("Registered pending request {}", id);
        rx
    }

    /// Complete a pending request
    /// Returns true if a waiter for `id` existed
    pub fn resolve(&self, id: RequestId, reply: Reply) -> bool {
        match self.requests.remove(&id) {
            Some((_, tx)) => {
                if tx.send(reply).is_err() {
                    debug!("Caller for request {} went away before its reply", id);
                }
                true
            }
            None => false,
        }
    }

    /// Drop a pending request without completing it (timeout or abandoned caller)
    pub fn cancel(&self, id: RequestId) -> bool {
        let removed = self.requests.remove(&id).is_some();
        if removed {
            debug!("Cancelled pending request {}", id);
        }
        removed
    }

    /// Fail every pending request with the same error
    /// Returns how many waiters were failed
    pub fn fail_all(&self, error: RelayError) -> usize {
        let ids: Vec<RequestId> = self.requests.iter().map(|entry| *entry.key()).collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.requests.remove(&id) {
                let _ = tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    /// Get count of pending requests
    pub fn count(&self) -> usize {
        self.requests.len()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
