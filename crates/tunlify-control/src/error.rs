//! Failure taxonomy for forwarded requests

use std::time::Duration;
use thiserror::Error;

use crate::session::TunnelKey;

/// Why a forwarded request did not produce a client reply
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("No live session for tunnel {0}")]
    NoSession(TunnelKey),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Failed to write to client channel: {0}")]
    TransportError(String),

    /// The channel broke after the request had been handed to the client
    #[error("Client channel failed")]
    ChannelFailed,

    #[error("Request does not fit in one channel message ({0} bytes encoded)")]
    PayloadTooLarge(usize),

    #[error("Session superseded by a newer connection")]
    Superseded,

    #[error("Client disconnected")]
    Disconnected,

    #[error("Session evicted after missed heartbeats")]
    Stale,

    #[error("Client reported error: {0}")]
    ClientReported(String),

    #[error("Invalid response from client: {0}")]
    InvalidResponse(String),
}
