//! Outbound half of a client channel
//!
//! Sessions never touch the socket directly. They queue frames on a
//! [`TransportHandle`] and a writer task owned by the endpoint drains the
//! matching [`TransportReceiver`]. Closing the handle is one-way: once closed
//! it refuses further messages.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tunlify_proto::TunnelMessage;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Policy violation (rejected token)
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Server-side failure
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Client channel closed")]
    Closed,
}

/// Frame queued for the writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(TunnelMessage),
    Close { code: u16, reason: String },
}

/// Create a connected handle/receiver pair
pub fn channel() -> (TransportHandle, TransportReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        TransportHandle {
            tx,
            closed: CancellationToken::new(),
        },
        TransportReceiver { rx },
    )
}

#[derive(Debug, Clone)]
pub struct TransportHandle {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: CancellationToken,
}

impl TransportHandle {
    /// Queue a message for the client
    pub fn send(&self, message: TunnelMessage) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        self.tx
            .send(Outbound::Message(message))
            .map_err(|_| TransportError::Closed)
    }

    /// Queue a close frame and refuse further sends
    ///
    /// Returns false if the handle was already closed.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.closed.cancel();

        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once the handle has been closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

#[derive(Debug)]
pub struct TransportReceiver {
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl TransportReceiver {
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }
}
