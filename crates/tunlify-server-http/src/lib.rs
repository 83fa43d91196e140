//! HTTP surface of the tunnel relay
//!
//! - `ANY /tunnel-proxy[/{*path}]`: public traffic routed here by the edge
//!   router, forwarded to the tunnel's client
//! - `GET /ws/tunnel?token=...`: client channel (WebSocket)
//! - `GET /health`: health check
pub mod error;
pub mod health;
pub mod proxy;
pub mod ws;

use axum::{
    routing::{any, get},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use tunlify_control::{
    AuthenticationGate, RelayConfig, RequestMultiplexer, SessionRegistry, TunnelHandler,
};
use tunlify_proto::CLIENT_CHANNEL_PATH;
use tunlify_relay_db::TunnelDirectory;

pub use error::ServerError;

/// Application state shared across handlers
pub struct AppState {
    pub directory: Arc<dyn TunnelDirectory>,
    pub registry: Arc<SessionRegistry>,
    pub gate: Arc<AuthenticationGate>,
    pub multiplexer: Arc<RequestMultiplexer>,
    pub handler: Arc<TunnelHandler>,
}

impl AppState {
    /// Wire up the relay core around a tunnel directory
    pub fn new(directory: Arc<dyn TunnelDirectory>, config: &RelayConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let gate = Arc::new(AuthenticationGate::new(
            directory.clone(),
            registry.clone(),
            config.base_domain.clone(),
        ));
        let multiplexer = Arc::new(RequestMultiplexer::new(registry.clone(), config));
        let handler = Arc::new(TunnelHandler::new(gate.clone(), multiplexer.clone()));

        Self {
            directory,
            registry,
            gate,
            multiplexer,
            handler,
        }
    }
}

/// Build the router with all routes
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tunnel-proxy", any(proxy::tunnel_proxy))
        .route("/tunnel-proxy/{*path}", any(proxy::tunnel_proxy))
        .route(CLIENT_CHANNEL_PATH, get(ws::tunnel_channel))
        .route("/health", get(health::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Relay HTTP server
pub struct RelayServer {
    bind_addr: SocketAddr,
    state: Arc<AppState>,
}

impl RelayServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<AppState>) -> Self {
        Self { bind_addr, state }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Serve until `shutdown` is cancelled
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        let router = build_router(self.state.clone());

        info!("Starting relay HTTP server on {}", self.bind_addr);
        info!(
            "Client channel: ws://{}{}?token=<connection token>",
            self.bind_addr, CLIENT_CHANNEL_PATH
        );

        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        info!("Relay HTTP server stopped");
        Ok(())
    }
}
