//! Authentication gate for client channels
//!
//! Binds a presented connection token to its tunnel record, writes the
//! connection state through to the directory and registers the session.

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use tunlify_proto::{TunnelInfo, TunnelMessage};
use tunlify_relay_db::{DirectoryError, TunnelDirectory, TunnelRecord};

use crate::connection::SessionRegistry;
use crate::session::{Session, SessionBinding, TeardownReason, TunnelKey};
use crate::transport::{TransportHandle, CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Connection token required")]
    MissingToken,

    #[error("Invalid connection token")]
    InvalidToken,

    #[error("Tunnel directory unavailable: {0}")]
    DirectoryUnavailable(#[from] DirectoryError),

    #[error("Client channel closed during authentication")]
    ChannelClosed,
}

impl AuthError {
    /// Close code sent to the client when authentication fails
    pub fn close_code(&self) -> u16 {
        match self {
            AuthError::MissingToken | AuthError::InvalidToken => CLOSE_POLICY_VIOLATION,
            AuthError::DirectoryUnavailable(_) | AuthError::ChannelClosed => CLOSE_INTERNAL_ERROR,
        }
    }
}

/// A freshly registered session and the identity announced to its client
#[derive(Debug, Clone)]
pub struct AuthenticatedTunnel {
    pub session: Arc<Session>,
    pub tunnel: TunnelInfo,
}

pub struct AuthenticationGate {
    directory: Arc<dyn TunnelDirectory>,
    registry: Arc<SessionRegistry>,
    base_domain: String,
}

impl AuthenticationGate {
    pub fn new(
        directory: Arc<dyn TunnelDirectory>,
        registry: Arc<SessionRegistry>,
        base_domain: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            registry,
            base_domain: base_domain.into(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<dyn TunnelDirectory> {
        &self.directory
    }

    /// Public URL of a tunnel
    pub fn public_url(&self, subdomain: &str, region: &str) -> String {
        format!("https://{}.{}.{}", subdomain, region, self.base_domain)
    }

    /// Authenticate a client channel and bind it to its tunnel
    ///
    /// The `connected` message is queued on `transport` before the session
    /// becomes visible, so it is always the first frame the client sees.
    pub async fn authenticate(
        &self,
        token: &str,
        transport: TransportHandle,
    ) -> Result<AuthenticatedTunnel, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let record = self
            .directory
            .get_by_token(token)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        self.directory.mark_connected(record.id).await?;

        let tunnel = self.tunnel_info(&record);
        if transport
            .send(TunnelMessage::Connected {
                tunnel: tunnel.clone(),
            })
            .is_err()
        {
            if let Err(e) = self.directory.mark_disconnected(record.id).await {
                warn!(tunnel_id = %record.id, "Failed to reset connection state: {}", e);
            }
            return Err(AuthError::ChannelClosed);
        }

        let key = TunnelKey::new(&record.subdomain, &record.region);
        let session = self.registry.register(
            key,
            SessionBinding {
                tunnel_id: record.id,
                owner_email: record.owner_email.clone(),
            },
            transport,
        );

        info!(
            tunnel = %session.key(),
            tunnel_id = %record.id,
            session_id = session.id(),
            "Client connected"
        );

        Ok(AuthenticatedTunnel { session, tunnel })
    }

    /// Tear a session down and release its key
    ///
    /// The directory is only marked disconnected when no newer session has
    /// taken over the key. Directory failures are logged, not returned.
    pub async fn disconnect(&self, session: &Session, reason: TeardownReason) {
        session.teardown(reason);
        self.registry.unregister(session.key(), session);

        if self.registry.is_owned_by_other(session.key(), session) {
            return;
        }

        if let Err(e) = self.directory.mark_disconnected(session.tunnel_id()).await {
            warn!(
                tunnel = %session.key(),
                tunnel_id = %session.tunnel_id(),
                "Failed to record disconnect: {}",
                e
            );
        }
    }

    fn tunnel_info(&self, record: &TunnelRecord) -> TunnelInfo {
        TunnelInfo {
            id: record.id.to_string(),
            subdomain: record.subdomain.clone(),
            region: record.region.clone(),
            url: self.public_url(&record.subdomain, &record.region),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{self, Outbound};
    use tunlify_relay_db::{MemoryTunnelDirectory, NewTunnel};
    use uuid::Uuid;

    async fn setup() -> (Arc<MemoryTunnelDirectory>, AuthenticationGate, TunnelRecord) {
        let directory = Arc::new(MemoryTunnelDirectory::new());
        let record = directory
            .create(NewTunnel {
                owner_id: Uuid::new_v4(),
                owner_email: Some("dev@example.com".to_string()),
                subdomain: "acme".to_string(),
                region: "us".to_string(),
            })
            .await
            .unwrap();

        let gate = AuthenticationGate::new(
            directory.clone(),
            Arc::new(SessionRegistry::new()),
            "tunlify.biz.id",
        );
        (directory, gate, record)
    }

    #[tokio::test]
    async fn test_valid_token_binds_session() {
        let (directory, gate, record) = setup().await;
        let (handle, mut rx) = transport::channel();

        let auth = gate
            .authenticate(&record.connection_token, handle)
            .await
            .unwrap();

        assert_eq!(auth.tunnel.url, "https://acme.us.tunlify.biz.id");
        assert_eq!(auth.tunnel.id, record.id.to_string());
        assert_eq!(auth.session.key(), &TunnelKey::new("acme", "us"));
        assert_eq!(auth.session.owner_email(), Some("dev@example.com"));

        let stored = directory.get(record.id).await.unwrap();
        assert!(stored.client_connected);

        match rx.recv().await {
            Some(Outbound::Message(TunnelMessage::Connected { tunnel })) => {
                assert_eq!(tunnel, auth.tunnel)
            }
            other => panic!("Expected connected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_tokens_leave_no_trace() {
        let (directory, gate, _record) = setup().await;
        let writes = directory.write_count();

        let (handle, _rx) = transport::channel();
        let err = gate.authenticate("   ", handle).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingToken));

        let (handle, _rx) = transport::channel();
        let err = gate.authenticate("not-a-token", handle).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
        assert_eq!(err.close_code(), CLOSE_POLICY_VIOLATION);

        assert_eq!(directory.write_count(), writes);
        assert!(gate.registry().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_marks_directory() {
        let (directory, gate, record) = setup().await;
        let (handle, _rx) = transport::channel();
        let auth = gate
            .authenticate(&record.connection_token, handle)
            .await
            .unwrap();

        gate.disconnect(&auth.session, TeardownReason::Disconnected)
            .await;

        assert!(gate.registry().is_empty());
        assert!(!directory.get(record.id).await.unwrap().client_connected);
    }

    #[tokio::test]
    async fn test_disconnect_of_superseded_session_keeps_directory_connected() {
        let (directory, gate, record) = setup().await;

        let (h1, _rx1) = transport::channel();
        let first = gate
            .authenticate(&record.connection_token, h1)
            .await
            .unwrap();
        let (h2, _rx2) = transport::channel();
        let second = gate
            .authenticate(&record.connection_token, h2)
            .await
            .unwrap();

        // The old channel's reader notices its close afterwards
        gate.disconnect(&first.session, TeardownReason::Disconnected)
            .await;

        assert!(directory.get(record.id).await.unwrap().client_connected);
        assert_eq!(
            gate.registry()
                .lookup(second.session.key())
                .unwrap()
                .id(),
            second.session.id()
        );
    }
}
