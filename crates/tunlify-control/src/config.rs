//! Relay tuning knobs

use std::time::Duration;

/// Default deadline for a forwarded request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between liveness sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Default silence after which a session is considered stale
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Public tunnel URLs are `https://{subdomain}.{region}.{base_domain}`
    pub base_domain: String,
    pub request_timeout: Duration,
    pub sweep_interval: Duration,
    pub stale_after: Duration,
    /// Send `cancel` to the client when a request times out or its caller goes away
    pub send_cancel_on_abandon: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_domain: "tunlify.biz.id".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            send_cancel_on_abandon: false,
        }
    }
}
