//! Liveness monitor
//!
//! Periodically evicts sessions whose client has gone quiet.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::AuthenticationGate;
use crate::config::RelayConfig;
use crate::session::{TeardownReason, TunnelKey};

pub struct LivenessMonitor {
    gate: Arc<AuthenticationGate>,
    sweep_interval: Duration,
    stale_after: Duration,
}

impl LivenessMonitor {
    pub fn new(gate: Arc<AuthenticationGate>, config: &RelayConfig) -> Self {
        Self {
            gate,
            sweep_interval: config.sweep_interval,
            stale_after: config.stale_after,
        }
    }

    /// Evict every session silent for longer than the stale threshold as of `now`
    ///
    /// Returns the keys that were evicted.
    pub async fn sweep_once(&self, now: Instant) -> Vec<TunnelKey> {
        let stale: Vec<_> = self
            .gate
            .registry()
            .sessions()
            .into_iter()
            .filter(|session| {
                !session.is_closed()
                    && now.saturating_duration_since(session.last_heartbeat()) > self.stale_after
            })
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for session in stale {
            info!(
                tunnel = %session.key(),
                session_id = session.id(),
                "Evicting stale session"
            );
            self.gate.disconnect(&session, TeardownReason::Stale).await;
            evicted.push(session.key().clone());
        }
        evicted
    }

    /// Run sweeps until `shutdown` is cancelled
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                Instant::now() + self.sweep_interval,
                self.sweep_interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Liveness monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = self.sweep_once(Instant::now()).await;
                        if !evicted.is_empty() {
                            info!("Evicted {} stale session(s)", evicted.len());
                        }
                    }
                }
            }
        })
    }
}
