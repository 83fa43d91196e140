//! A live client session bound to one tunnel

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};
use tokio::time::Instant;
use tracing::info;
use tunlify_proto::{RequestId, TunnelMessage};
use uuid::Uuid;

use crate::error::RelayError;
use crate::pending_requests::PendingRequests;
use crate::transport::{TransportError, TransportHandle, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL};

/// Public identity of a tunnel: `(subdomain, region)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    pub subdomain: String,
    pub region: String,
}

impl TunnelKey {
    pub fn new(subdomain: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            subdomain: subdomain.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.subdomain, self.region)
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// A newer session authenticated for the same key
    Superseded,
    /// The client closed its channel
    Disconnected,
    /// No inbound traffic within the stale threshold
    Stale,
    /// Reading from or writing to the channel failed
    TransportError,
}

impl TeardownReason {
    fn close_frame(self) -> (u16, &'static str) {
        match self {
            TeardownReason::Superseded => (CLOSE_NORMAL, "Superseded by a newer connection"),
            TeardownReason::Disconnected => (CLOSE_NORMAL, "Disconnected"),
            TeardownReason::Stale => (CLOSE_NORMAL, "Heartbeat timeout"),
            TeardownReason::TransportError => (CLOSE_INTERNAL_ERROR, "Transport error"),
        }
    }
}

impl From<TeardownReason> for RelayError {
    fn from(reason: TeardownReason) -> Self {
        match reason {
            TeardownReason::Superseded => RelayError::Superseded,
            TeardownReason::Disconnected => RelayError::Disconnected,
            TeardownReason::Stale => RelayError::Stale,
            TeardownReason::TransportError => RelayError::ChannelFailed,
        }
    }
}

/// Directory facts a session carries for its lifetime
#[derive(Debug, Clone)]
pub struct SessionBinding {
    pub tunnel_id: Uuid,
    pub owner_email: Option<String>,
}

pub struct Session {
    id: u64,
    key: TunnelKey,
    binding: SessionBinding,
    transport: TransportHandle,
    local_address: RwLock<Option<String>>,
    started_at: Instant,
    /// Milliseconds since `started_at` of the last inbound message
    last_heartbeat_ms: AtomicU64,
    next_request_id: AtomicU64,
    pending: PendingRequests,
    teardown: OnceLock<TeardownReason>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        key: TunnelKey,
        binding: SessionBinding,
        transport: TransportHandle,
    ) -> Self {
        Self {
            id,
            key,
            binding,
            transport,
            local_address: RwLock::new(None),
            started_at: Instant::now(),
            last_heartbeat_ms: AtomicU64::new(0),
            next_request_id: AtomicU64::new(0),
            pending: PendingRequests::new(),
            teardown: OnceLock::new(),
        }
    }

    /// Registry-assigned id, distinct for every session
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &TunnelKey {
        &self.key
    }

    pub fn tunnel_id(&self) -> Uuid {
        self.binding.tunnel_id
    }

    pub fn owner_email(&self) -> Option<&str> {
        self.binding.owner_email.as_deref()
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// Address the client reported for its local service
    pub fn local_address(&self) -> Option<String> {
        self.local_address
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn set_local_address(&self, address: String) {
        match self.local_address.write() {
            Ok(mut guard) => *guard = Some(address),
            Err(poisoned) => *poisoned.into_inner() = Some(address),
        }
    }

    /// Record inbound traffic
    pub fn touch(&self) {
        let elapsed = Instant::now().saturating_duration_since(self.started_at);
        self.last_heartbeat_ms
            .fetch_max(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// When the client was last heard from (session creation counts)
    pub fn last_heartbeat(&self) -> Instant {
        self.started_at
            + std::time::Duration::from_millis(self.last_heartbeat_ms.load(Ordering::Relaxed))
    }

    /// Allocate the next correlation id (1, 2, 3, ...)
    pub fn next_request_id(&self) -> RequestId {
        RequestId(self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn send(&self, message: TunnelMessage) -> Result<(), TransportError> {
        self.transport.send(message)
    }

    /// End the session: fail every pending request with `reason` and close the channel
    ///
    /// Only the first call has any effect; it returns true.
    pub fn teardown(&self, reason: TeardownReason) -> bool {
        if self.teardown.set(reason).is_err() {
            return false;
        }

        let failed = self.pending.fail_all(reason.into());
        let (code, text) = reason.close_frame();
        self.transport.close(code, text);

        info!(
            tunnel = %self.key,
            session_id = self.id,
            ?reason,
            failed_requests = failed,
            "Session closed"
        );
        true
    }

    pub fn teardown_reason(&self) -> Option<TeardownReason> {
        self.teardown.get().copied()
    }

    pub fn is_closed(&self) -> bool {
        self.teardown.get().is_some()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("tunnel_id", &self.binding.tunnel_id)
            .field("pending", &self.pending.count())
            .field("teardown", &self.teardown.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{self, Outbound};
    use std::time::Duration;

    fn session() -> (Session, transport::TransportReceiver) {
        let (handle, rx) = transport::channel();
        let binding = SessionBinding {
            tunnel_id: Uuid::new_v4(),
            owner_email: Some("dev@example.com".to_string()),
        };
        (Session::new(1, TunnelKey::new("acme", "us"), binding, handle), rx)
    }

    #[test]
    fn test_key_display() {
        assert_eq!(TunnelKey::new("acme", "us").to_string(), "acme.us");
    }

    #[tokio::test]
    async fn test_request_ids_increase_from_one() {
        let (session, _rx) = session();
        assert_eq!(session.next_request_id(), RequestId(1));
        assert_eq!(session.next_request_id(), RequestId(2));
        assert_eq!(session.next_request_id(), RequestId(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_advances_heartbeat() {
        let (session, _rx) = session();
        let created = session.last_heartbeat();

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(session.last_heartbeat(), created);

        session.touch();
        assert_eq!(session.last_heartbeat(), created + Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_teardown_runs_once() {
        let (session, mut rx) = session();
        let waiter = session.pending().register(RequestId(1));

        assert!(session.teardown(TeardownReason::Stale));
        assert!(!session.teardown(TeardownReason::Disconnected));

        assert_eq!(session.teardown_reason(), Some(TeardownReason::Stale));
        assert_eq!(waiter.await.unwrap(), Err(RelayError::Stale));
        assert!(matches!(
            rx.recv().await,
            Some(Outbound::Close {
                code: CLOSE_NORMAL,
                ..
            })
        ));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_transport_error_closes_with_1011() {
        let (session, mut rx) = session();
        let waiter = session.pending().register(RequestId(1));
        session.teardown(TeardownReason::TransportError);

        // The request already reached the client, so it was interrupted
        assert_eq!(waiter.await.unwrap(), Err(RelayError::ChannelFailed));

        assert!(matches!(
            rx.recv().await,
            Some(Outbound::Close {
                code: CLOSE_INTERNAL_ERROR,
                ..
            })
        ));
        assert!(session.send(TunnelMessage::HeartbeatAck).is_err());
    }

    #[tokio::test]
    async fn test_local_address_hint() {
        let (session, _rx) = session();
        assert_eq!(session.local_address(), None);

        session.set_local_address("127.0.0.1:3000".to_string());
        assert_eq!(session.local_address().as_deref(), Some("127.0.0.1:3000"));
        assert_eq!(session.owner_email(), Some("dev@example.com"));
    }
}
