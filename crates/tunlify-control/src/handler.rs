//! Client channel handler
//!
//! Drives one client channel from authentication to teardown. The endpoint
//! owns the socket: it feeds inbound text frames into [`TunnelHandler::run`]
//! and writes whatever appears on the [`TransportReceiver`].

use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tunlify_proto::{decode, CodecError};

use crate::auth::{AuthError, AuthenticatedTunnel, AuthenticationGate};
use crate::multiplexer::RequestMultiplexer;
use crate::session::{Session, TeardownReason};
use crate::transport::{self, TransportReceiver};

pub struct TunnelHandler {
    gate: Arc<AuthenticationGate>,
    multiplexer: Arc<RequestMultiplexer>,
}

impl TunnelHandler {
    pub fn new(gate: Arc<AuthenticationGate>, multiplexer: Arc<RequestMultiplexer>) -> Self {
        Self { gate, multiplexer }
    }

    pub fn gate(&self) -> &Arc<AuthenticationGate> {
        &self.gate
    }

    /// Authenticate a new client channel
    ///
    /// On success the returned receiver already holds the `connected` frame.
    /// On failure nothing was registered; the caller closes the socket with
    /// [`AuthError::close_code`].
    pub async fn open(
        &self,
        token: Option<&str>,
    ) -> Result<(AuthenticatedTunnel, TransportReceiver), AuthError> {
        let (handle, receiver) = transport::channel();

        match self.gate.authenticate(token.unwrap_or_default(), handle).await {
            Ok(tunnel) => Ok((tunnel, receiver)),
            Err(e) => {
                match &e {
                    AuthError::DirectoryUnavailable(_) => {
                        error!("Client authentication failed: {}", e)
                    }
                    _ => warn!("Client authentication rejected: {}", e),
                }
                Err(e)
            }
        }
    }

    /// Pump inbound frames into the session until either side ends it
    ///
    /// Returns the reason the session ended. Undecodable frames are logged and
    /// skipped; an unreadable reply that still names its request fails that
    /// request instead of leaving it to time out.
    pub async fn run<S, E>(&self, session: Arc<Session>, mut inbound: S) -> TeardownReason
    where
        S: Stream<Item = Result<String, E>> + Unpin,
        E: Display,
    {
        let reason = loop {
            tokio::select! {
                _ = session.transport().closed() => {
                    break session
                        .teardown_reason()
                        .unwrap_or(TeardownReason::TransportError);
                }
                frame = inbound.next() => {
                    match frame {
                        Some(Ok(text)) => {
                            let message = match decode(&text) {
                                Ok(message) => message,
                                Err(CodecError::UnknownType(kind)) => {
                                    debug!(tunnel = %session.key(), "Ignoring unknown message type {}", kind);
                                    session.touch();
                                    continue;
                                }
                                Err(CodecError::Malformed { kind, id: Some(id), source })
                                    if kind == "response" || kind == "error" =>
                                {
                                    warn!(tunnel = %session.key(), request_id = %id, "Unreadable {} from client: {}", kind, source);
                                    self.multiplexer.reject_reply(&session, id, source.to_string());
                                    continue;
                                }
                                Err(e) => {
                                    warn!(tunnel = %session.key(), "Ignoring malformed message: {}", e);
                                    continue;
                                }
                            };

                            if let Err(e) = self.multiplexer.intake(&session, message) {
                                warn!(tunnel = %session.key(), "Failed to reply to client: {}", e);
                                break TeardownReason::TransportError;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(tunnel = %session.key(), "Client channel error: {}", e);
                            break TeardownReason::TransportError;
                        }
                        None => {
                            info!(tunnel = %session.key(), "Client channel closed");
                            break TeardownReason::Disconnected;
                        }
                    }
                }
            }
        };

        self.gate.disconnect(&session, reason).await;

        session.teardown_reason().unwrap_or(reason)
    }
}
