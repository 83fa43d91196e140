//! Control plane for the tunnel relay
//!
//! Owns every live client session: binding a session to a tunnel, correlating
//! forwarded requests with their replies, and evicting silent clients.
pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod liveness;
pub mod multiplexer;
pub mod pending_requests;
pub mod session;
pub mod transport;

pub use auth::{AuthError, AuthenticatedTunnel, AuthenticationGate};
pub use config::RelayConfig;
pub use connection::SessionRegistry;
pub use error::RelayError;
pub use handler::TunnelHandler;
pub use liveness::LivenessMonitor;
pub use multiplexer::{ForwardedRequest, ForwardedResponse, RequestMultiplexer};
pub use pending_requests::PendingRequests;
pub use session::{Session, SessionBinding, TeardownReason, TunnelKey};
pub use transport::{Outbound, TransportError, TransportHandle, TransportReceiver};
