//! Errors surfaced to public callers
//!
//! Every failure on the proxy path becomes a small JSON body
//! `{message, status, help}`; internal detail stays in the logs.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tunlify_control::RelayError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Missing X-Tunnel-Subdomain or X-Tunnel-Region header")]
    MissingRoutingHeaders,

    #[error("Tunnel {0} not found")]
    TunnelNotFound(String),

    #[error("Tunnel {0} has no connected client")]
    ClientNotConnected(String),

    #[error("Tunnel directory unavailable")]
    DirectoryUnavailable,

    #[error("Request body too large")]
    PayloadTooLarge,

    #[error("Request to {tunnel} failed: {source}")]
    Relay {
        tunnel: String,
        #[source]
        source: RelayError,
    },

    #[error("Tunnel client sent invalid status code {0}")]
    InvalidStatus(u16),
}

/// JSON body of every synthetic error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub status: u16,
    pub help: String,
    /// Client-reported failure text, when there is one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::MissingRoutingHeaders => StatusCode::BAD_REQUEST,
            ServerError::TunnelNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::ClientNotConnected(_) | ServerError::DirectoryUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ServerError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ServerError::InvalidStatus(_) => StatusCode::BAD_GATEWAY,
            ServerError::Relay { source, .. } => match source {
                RelayError::NoSession(_)
                | RelayError::Superseded
                | RelayError::Disconnected
                | RelayError::Stale
                | RelayError::ChannelFailed => StatusCode::SERVICE_UNAVAILABLE,
                RelayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                RelayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
                RelayError::TransportError(_)
                | RelayError::ClientReported(_)
                | RelayError::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
            },
        }
    }

    fn body(&self) -> ErrorBody {
        let (message, help) = match self {
            ServerError::MissingRoutingHeaders => (
                "Invalid tunnel request",
                "Requests must arrive through the tunnel edge router",
            ),
            ServerError::TunnelNotFound(_) => (
                "Tunnel not found",
                "Make sure your tunnel is active and client is connected",
            ),
            ServerError::ClientNotConnected(_) => (
                "Tunnel client not connected",
                "Start your tunnel client with the connection token",
            ),
            ServerError::DirectoryUnavailable => {
                ("Service Unavailable", "Try again in a few moments")
            }
            ServerError::PayloadTooLarge => (
                "Request body too large",
                "Send a smaller request body",
            ),
            ServerError::InvalidStatus(_) => (
                "Bad Gateway",
                "Your tunnel client returned an invalid response; update it to the latest version",
            ),
            ServerError::Relay { source, .. } => match source {
                RelayError::NoSession(_) => (
                    "Tunnel client not connected",
                    "Start your tunnel client with the connection token",
                ),
                RelayError::Timeout(_) => (
                    "Gateway Timeout",
                    "Check if your local application is running and responsive",
                ),
                RelayError::Superseded
                | RelayError::Disconnected
                | RelayError::Stale
                | RelayError::ChannelFailed => (
                    "Tunnel client disconnected during request",
                    "Restart your tunnel client",
                ),
                RelayError::PayloadTooLarge(_) => (
                    "Request body too large",
                    "Send a smaller request body",
                ),
                RelayError::TransportError(_) => (
                    "Unable to forward request to tunnel client",
                    "Restart your tunnel client",
                ),
                RelayError::ClientReported(_) => (
                    "Bad Gateway",
                    "Check if your local application is running and responsive",
                ),
                RelayError::InvalidResponse(_) => (
                    "Bad Gateway",
                    "Your tunnel client returned an invalid response; update it to the latest version",
                ),
            },
        };

        let error = match self {
            ServerError::Relay {
                source: RelayError::ClientReported(text),
                ..
            } => Some(text.clone()),
            _ => None,
        };

        ErrorBody {
            message: message.to_string(),
            status: self.status_code().as_u16(),
            help: help.to_string(),
            error,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn relay(source: RelayError) -> ServerError {
        ServerError::Relay {
            tunnel: "acme.us".to_string(),
            source,
        }
    }

    #[test]
    fn test_relay_status_mapping() {
        assert_eq!(
            relay(RelayError::Timeout(Duration::from_secs(30))).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        for interrupted in [
            RelayError::Superseded,
            RelayError::Disconnected,
            RelayError::Stale,
            RelayError::ChannelFailed,
        ] {
            assert_eq!(
                relay(interrupted).status_code(),
                StatusCode::SERVICE_UNAVAILABLE
            );
        }
        assert_eq!(
            relay(RelayError::TransportError("broken pipe".to_string())).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            relay(RelayError::InvalidResponse("bad base64".to_string())).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            relay(RelayError::PayloadTooLarge(18_874_444)).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_client_reported_text_is_surfaced() {
        let body = relay(RelayError::ClientReported("ECONNREFUSED".to_string())).body();
        assert_eq!(body.status, 502);
        assert_eq!(body.error.as_deref(), Some("ECONNREFUSED"));
    }

    #[test]
    fn test_internal_detail_is_not_surfaced() {
        let body = relay(RelayError::TransportError("socket reset by peer".to_string())).body();
        assert_eq!(body.error, None);
        assert!(!body.message.contains("socket"));
    }

    #[test]
    fn test_missing_headers_body() {
        let body = ServerError::MissingRoutingHeaders.body();
        assert_eq!(body.status, 400);
        assert_eq!(body.message, "Invalid tunnel request");
        assert!(!body.help.is_empty());
    }
}
