//! Registry of live sessions
//!
//! At most one session is registered per [`TunnelKey`]. Registering a new
//! session for a taken key swaps it in atomically and tears the previous one
//! down as superseded.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::session::{Session, SessionBinding, TeardownReason, TunnelKey};
use crate::transport::TransportHandle;

pub struct SessionRegistry {
    sessions: DashMap<TunnelKey, Arc<Session>>,
    next_session_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Bind a new session to `key`, replacing any existing one
    pub fn register(
        &self,
        key: TunnelKey,
        binding: SessionBinding,
        transport: TransportHandle,
    ) -> Arc<Session> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, key.clone(), binding, transport));

        let previous = self.sessions.insert(key.clone(), session.clone());

        if let Some(previous) = previous {
            info!(
                tunnel = %key,
                old_session = previous.id(),
                new_session = id,
                "Replacing existing session"
            );
            previous.teardown(TeardownReason::Superseded);
        } else {
            debug!(tunnel = %key, session_id = id, "Session registered");
        }

        session
    }

    /// Live session for `key`, if any
    pub fn lookup(&self, key: &TunnelKey) -> Option<Arc<Session>> {
        self.sessions
            .get(key)
            .map(|entry| entry.value().clone())
            .filter(|session| !session.is_closed())
    }

    /// Remove `session` from `key`, but only if it is still the registered one
    pub fn unregister(&self, key: &TunnelKey, session: &Session) -> bool {
        let removed = self
            .sessions
            .remove_if(key, |_, current| current.id() == session.id())
            .is_some();

        if removed {
            debug!(tunnel = %key, session_id = session.id(), "Session unregistered");
        }
        removed
    }

    /// Whether a session other than `session` now owns `key`
    pub fn is_owned_by_other(&self, key: &TunnelKey, session: &Session) -> bool {
        self.sessions
            .get(key)
            .is_some_and(|entry| entry.value().id() != session.id())
    }

    /// Snapshot of every registered session
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<TunnelKey> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
