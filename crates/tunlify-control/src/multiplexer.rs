//! Request multiplexer
//!
//! Forwards public requests over a tunnel's session and correlates each
//! client reply with the caller waiting on it. Many requests may be in flight
//! on one session; replies can arrive in any order.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use tunlify_proto::{
    check_encodable, decode_body, encode_body, CodecError, Headers, RequestId, TunnelMessage,
};

use crate::config::RelayConfig;
use crate::connection::SessionRegistry;
use crate::error::RelayError;
use crate::session::{Session, TeardownReason, TunnelKey};
use crate::transport::TransportError;

/// A public request ready to be forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedRequest {
    pub method: String,
    /// Path plus query, always starting with `/`
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// The client's reply to a forwarded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedResponse {
    pub status_code: u16,
    pub headers: Headers,
    pub body: Bytes,
}

pub struct RequestMultiplexer {
    registry: Arc<SessionRegistry>,
    request_timeout: Duration,
    send_cancel_on_abandon: bool,
}

impl RequestMultiplexer {
    pub fn new(registry: Arc<SessionRegistry>, config: &RelayConfig) -> Self {
        Self {
            registry,
            request_timeout: config.request_timeout,
            send_cancel_on_abandon: config.send_cancel_on_abandon,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Forward a request using the configured deadline
    pub async fn forward(
        &self,
        key: &TunnelKey,
        request: ForwardedRequest,
    ) -> Result<ForwardedResponse, RelayError> {
        self.dispatch(key, request, self.request_timeout).await
    }

    /// Forward a request to the session bound to `key` and wait for its reply
    ///
    /// Every outcome flows through the request's waiter, so a reply, a
    /// session teardown and a timeout cannot both complete the same request.
    /// Dropping the returned future removes the waiter.
    pub async fn dispatch(
        &self,
        key: &TunnelKey,
        request: ForwardedRequest,
        timeout: Duration,
    ) -> Result<ForwardedResponse, RelayError> {
        let session = self
            .registry
            .lookup(key)
            .ok_or_else(|| RelayError::NoSession(key.clone()))?;

        let id = session.next_request_id();
        let reply = session.pending().register(id);
        let mut waiter = WaiterGuard {
            session: &session,
            id,
            send_cancel: self.send_cancel_on_abandon,
            completed: false,
        };

        if let Some(reason) = session.teardown_reason() {
            // Session closed between lookup and registration
            session.pending().resolve(id, Err(reason.into()));
        } else {
            let (body, body_encoding) = encode_body(&request.body);
            debug!(
                tunnel = %key,
                request_id = %id,
                method = %request.method,
                url = %request.url,
                "Forwarding request"
            );

            let message = TunnelMessage::Request {
                id,
                method: request.method,
                url: request.url,
                headers: request.headers,
                body,
                body_encoding,
            };

            if let Err(e) = check_encodable(&message) {
                // The session is fine; only this request cannot be framed
                warn!(tunnel = %key, request_id = %id, "Cannot forward request: {}", e);
                let error = match e {
                    CodecError::MessageTooLarge(len) => RelayError::PayloadTooLarge(len),
                    other => RelayError::TransportError(other.to_string()),
                };
                session.pending().resolve(id, Err(error));
            } else if let Err(e) = session.send(message) {
                warn!(tunnel = %key, request_id = %id, "Failed to forward request: {}", e);
                session
                    .pending()
                    .resolve(id, Err(RelayError::TransportError(e.to_string())));
                session.teardown(TeardownReason::TransportError);
                self.registry.unregister(key, &session);
            }
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => {
                waiter.completed = true;
                result
            }
            Ok(Err(_)) => {
                waiter.completed = true;
                Err(RelayError::Disconnected)
            }
            Err(_) => {
                debug!(tunnel = %key, request_id = %id, "Request timed out after {:?}", timeout);
                Err(RelayError::Timeout(timeout))
            }
        }
    }

    /// Handle one inbound message from a session's client
    ///
    /// Any inbound message counts as proof of life. An error is returned only
    /// when a reply to the client could not be queued.
    pub fn intake(&self, session: &Session, message: TunnelMessage) -> Result<(), TransportError> {
        session.touch();

        match message {
            TunnelMessage::Response {
                id,
                status_code,
                headers,
                body,
                body_encoding,
            } => {
                let reply = decode_body(body, body_encoding)
                    .map(|body| ForwardedResponse {
                        status_code,
                        headers,
                        body: Bytes::from(body),
                    })
                    .map_err(|e| RelayError::InvalidResponse(e.to_string()));

                if !session.pending().resolve(id, reply) {
                    debug!(tunnel = %session.key(), request_id = %id, "Discarding late response");
                }
            }
            TunnelMessage::Error { id, message } => {
                if !session
                    .pending()
                    .resolve(id, Err(RelayError::ClientReported(message)))
                {
                    debug!(tunnel = %session.key(), request_id = %id, "Discarding late error");
                }
            }
            TunnelMessage::Heartbeat => session.send(TunnelMessage::HeartbeatAck)?,
            TunnelMessage::SetLocalAddress { address } => {
                debug!(tunnel = %session.key(), %address, "Client local address");
                session.set_local_address(address.clone());
                session.send(TunnelMessage::LocalAddressAck { address })?;
            }
            other => {
                warn!(
                    tunnel = %session.key(),
                    kind = other.kind(),
                    "Ignoring relay-bound message from client"
                );
            }
        }

        Ok(())
    }

    /// Fail a pending request whose reply arrived but could not be read
    ///
    /// Counts as proof of life like any other inbound message.
    pub fn reject_reply(&self, session: &Session, id: RequestId, reason: String) {
        session.touch();

        if !session
            .pending()
            .resolve(id, Err(RelayError::InvalidResponse(reason)))
        {
            debug!(tunnel = %session.key(), request_id = %id, "Discarding unreadable late reply");
        }
    }
}

/// Removes an abandoned waiter when `dispatch` returns early or is dropped
struct WaiterGuard<'a> {
    session: &'a Session,
    id: RequestId,
    send_cancel: bool,
    completed: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.completed || !self.session.pending().cancel(self.id) {
            return;
        }

        if self.send_cancel && !self.session.is_closed() {
            let _ = self
                .session
                .send(TunnelMessage::Cancel { id: self.id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionBinding;
    use crate::transport::{self, Outbound, TransportReceiver};
    use serde_json::json;
    use tunlify_proto::BodyEncoding;
    use uuid::Uuid;

    fn setup(config: RelayConfig) -> (RequestMultiplexer, Arc<Session>, TransportReceiver) {
        let registry = Arc::new(SessionRegistry::new());
        let (handle, rx) = transport::channel();
        let session = registry.register(
            TunnelKey::new("acme", "us"),
            SessionBinding {
                tunnel_id: Uuid::new_v4(),
                owner_email: None,
            },
            handle,
        );
        (RequestMultiplexer::new(registry, &config), session, rx)
    }

    fn get(url: &str) -> ForwardedRequest {
        ForwardedRequest {
            method: "GET".to_string(),
            url: url.to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    async fn next_request_id(rx: &mut TransportReceiver) -> RequestId {
        match rx.recv().await {
            Some(Outbound::Message(TunnelMessage::Request { id, .. })) => id,
            other => panic!("Expected request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_unknown_key() {
        let (mux, _session, _rx) = setup(RelayConfig::default());
        let key = TunnelKey::new("ghost", "eu");

        let err = mux.forward(&key, get("/")).await.unwrap_err();
        assert_eq!(err, RelayError::NoSession(key));
    }

    #[tokio::test]
    async fn test_response_resolves_dispatch() {
        let (mux, session, mut rx) = setup(RelayConfig::default());
        let key = session.key().clone();
        let mux = Arc::new(mux);

        let call = tokio::spawn({
            let mux = mux.clone();
            async move { mux.forward(&key, get("/status")).await }
        });

        let id = next_request_id(&mut rx).await;
        assert_eq!(id, RequestId(1));
        assert_eq!(session.pending().count(), 1);

        mux.intake(
            &session,
            TunnelMessage::Response {
                id,
                status_code: 200,
                headers: Headers::new(),
                body: Some(json!("ok")),
                body_encoding: None,
            },
        )
        .unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, Bytes::from_static(b"ok"));
        assert_eq!(session.pending().count(), 0);
    }

    #[tokio::test]
    async fn test_binary_body_is_base64_on_the_wire() {
        let (mux, session, mut rx) = setup(RelayConfig::default());
        let key = session.key().clone();
        let mux = Arc::new(mux);

        let call = tokio::spawn({
            let mux = mux.clone();
            async move {
                let mut request = get("/upload");
                request.method = "POST".to_string();
                request.body = Bytes::from_static(&[0xff, 0x00, 0x10]);
                mux.forward(&key, request).await
            }
        });

        let id = match rx.recv().await {
            Some(Outbound::Message(TunnelMessage::Request {
                id,
                body,
                body_encoding,
                ..
            })) => {
                assert_eq!(body.as_deref(), Some("/wAQ"));
                assert_eq!(body_encoding, Some(BodyEncoding::Base64));
                id
            }
            other => panic!("Expected request, got {:?}", other),
        };

        mux.intake(
            &session,
            TunnelMessage::Response {
                id,
                status_code: 201,
                headers: Headers::new(),
                body: Some(json!("AAE=")),
                body_encoding: Some(BodyEncoding::Base64),
            },
        )
        .unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.body, Bytes::from_static(&[0x00, 0x01]));
    }

    #[tokio::test]
    async fn test_client_error_is_reported() {
        let (mux, session, mut rx) = setup(RelayConfig::default());
        let key = session.key().clone();
        let mux = Arc::new(mux);

        let call = tokio::spawn({
            let mux = mux.clone();
            async move { mux.forward(&key, get("/")).await }
        });

        let id = next_request_id(&mut rx).await;
        mux.intake(
            &session,
            TunnelMessage::Error {
                id,
                message: "connection refused".to_string(),
            },
        )
        .unwrap();

        assert_eq!(
            call.await.unwrap(),
            Err(RelayError::ClientReported("connection refused".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_waiter_and_discards_late_reply() {
        let (mux, session, mut rx) = setup(RelayConfig::default());
        let key = session.key().clone();

        let err = mux
            .dispatch(&key, get("/slow"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Timeout(Duration::from_secs(5)));
        assert_eq!(session.pending().count(), 0);

        let id = next_request_id(&mut rx).await;
        // Cancel messages are opt-in
        assert!(rx.try_recv().is_none());

        mux.intake(
            &session,
            TunnelMessage::Response {
                id,
                status_code: 200,
                headers: Headers::new(),
                body: None,
                body_encoding: None,
            },
        )
        .unwrap();
        assert_eq!(session.pending().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_sends_cancel_when_enabled() {
        let config = RelayConfig {
            send_cancel_on_abandon: true,
            ..RelayConfig::default()
        };
        let (mux, session, mut rx) = setup(config);
        let key = session.key().clone();

        let _ = mux
            .dispatch(&key, get("/slow"), Duration::from_secs(1))
            .await;

        let id = next_request_id(&mut rx).await;
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Message(TunnelMessage::Cancel { id }))
        );
    }

    #[tokio::test]
    async fn test_invalid_base64_response_is_rejected() {
        let (mux, session, mut rx) = setup(RelayConfig::default());
        let key = session.key().clone();
        let mux = Arc::new(mux);

        let call = tokio::spawn({
            let mux = mux.clone();
            async move { mux.forward(&key, get("/")).await }
        });

        let id = next_request_id(&mut rx).await;
        mux.intake(
            &session,
            TunnelMessage::Response {
                id,
                status_code: 200,
                headers: Headers::new(),
                body: Some(json!("!!!")),
                body_encoding: Some(BodyEncoding::Base64),
            },
        )
        .unwrap();

        assert!(matches!(
            call.await.unwrap(),
            Err(RelayError::InvalidResponse(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unframeable_request_fails_without_waiting() {
        let (mux, session, mut rx) = setup(RelayConfig::default());
        let key = session.key().clone();
        let started = tokio::time::Instant::now();

        // NUL bytes are valid UTF-8 but grow sixfold once JSON-escaped
        let mut request = get("/upload");
        request.method = "POST".to_string();
        request.body = Bytes::from(vec![0u8; 3 * 1024 * 1024]);

        let err = mux.forward(&key, request).await.unwrap_err();

        assert!(matches!(err, RelayError::PayloadTooLarge(len) if len > 16 * 1024 * 1024));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(session.pending().count(), 0);
        assert!(rx.try_recv().is_none());
        assert!(!session.is_closed());
        assert!(mux.registry().lookup(&key).is_some());
    }

    #[tokio::test]
    async fn test_unreadable_reply_fails_its_request() {
        let (mux, session, mut rx) = setup(RelayConfig::default());
        let key = session.key().clone();
        let mux = Arc::new(mux);

        let call = tokio::spawn({
            let mux = mux.clone();
            async move { mux.forward(&key, get("/")).await }
        });

        let id = next_request_id(&mut rx).await;
        mux.reject_reply(&session, id, "invalid type: string".to_string());

        assert!(matches!(
            call.await.unwrap(),
            Err(RelayError::InvalidResponse(_))
        ));
        assert_eq!(session.pending().count(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_replies_leave_other_waiters_alone() {
        let (mux, session, mut rx) = setup(RelayConfig::default());
        let key = session.key().clone();
        let mux = Arc::new(mux);

        let call = tokio::spawn({
            let mux = mux.clone();
            async move { mux.forward(&key, get("/a")).await }
        });
        let id = next_request_id(&mut rx).await;

        mux.intake(
            &session,
            TunnelMessage::Response {
                id: RequestId(999),
                status_code: 500,
                headers: Headers::new(),
                body: Some(json!("wrong")),
                body_encoding: None,
            },
        )
        .unwrap();
        mux.intake(
            &session,
            TunnelMessage::Error {
                id: RequestId(998),
                message: "wrong".to_string(),
            },
        )
        .unwrap();
        mux.reject_reply(&session, RequestId(997), "bad".to_string());
        assert_eq!(session.pending().count(), 1);

        mux.intake(
            &session,
            TunnelMessage::Response {
                id,
                status_code: 200,
                headers: Headers::new(),
                body: Some(json!("a")),
                body_encoding: None,
            },
        )
        .unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, Bytes::from_static(b"a"));
    }

    #[tokio::test]
    async fn test_send_failure_tears_session_down() {
        let (mux, session, rx) = setup(RelayConfig::default());
        let key = session.key().clone();
        drop(rx);

        let err = mux.forward(&key, get("/")).await.unwrap_err();
        assert!(matches!(err, RelayError::TransportError(_)));
        assert_eq!(
            session.teardown_reason(),
            Some(TeardownReason::TransportError)
        );
        assert!(mux.registry().lookup(&key).is_none());
        assert!(mux.registry().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_and_local_address_are_acknowledged() {
        let (mux, session, mut rx) = setup(RelayConfig::default());

        mux.intake(&session, TunnelMessage::Heartbeat).unwrap();
        mux.intake(
            &session,
            TunnelMessage::SetLocalAddress {
                address: "localhost:8080".to_string(),
            },
        )
        .unwrap();
        // Relay-bound kinds from a client are ignored
        mux.intake(&session, TunnelMessage::HeartbeatAck).unwrap();

        assert_eq!(
            rx.recv().await,
            Some(Outbound::Message(TunnelMessage::HeartbeatAck))
        );
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Message(TunnelMessage::LocalAddressAck {
                address: "localhost:8080".to_string()
            }))
        );
        assert!(rx.try_recv().is_none());
        assert_eq!(session.local_address().as_deref(), Some("localhost:8080"));
    }
}
