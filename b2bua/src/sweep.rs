//! Supervisory loops: dialog expiry sweeping, nonce eviction and
//! dependency health probing.

use crate::relay::MediaRelayClient;
use crate::session::SessionManager;
use crate::store::KvStore;
use parking_lot::RwLock;
use serde::Serialize;
use sip_auth::DigestAuthenticator;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DIALOG_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const NONCE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub detail: String,
    pub checked_at: u64,
}

/// Latest pass/fail observation per probed dependency
#[derive(Default)]
pub struct HealthState {
    components: RwLock<HashMap<String, ComponentHealth>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, component: &str, healthy: bool, detail: impl Into<String>) {
        self.components.write().insert(
            component.to_owned(),
            ComponentHealth {
                healthy,
                detail: detail.into(),
                checked_at: crate::call::unix_now(),
            },
        );
    }

    pub fn snapshot(&self) -> HashMap<String, ComponentHealth> {
        self.components.read().clone()
    }
}

/// Every 30s, terminate calls whose dialogs have been idle past the
/// configured timeout
pub async fn dialog_sweeper(
    sessions: Arc<SessionManager>,
    dialog_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(DIALOG_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }

        let mut expired = Vec::new();

        for (id, handle) in sessions.registry().snapshot() {
            let call = handle.call.lock().await;

            if call.last_activity.elapsed() > dialog_timeout {
                expired.push(id);
            }
        }

        for id in expired {
            log::info!("sweeping idle session {id}");
            sessions.terminate(&id).await;
        }
    }
}

/// Every minute, drop nonces past their garbage collection age
pub async fn nonce_sweeper(
    authenticator: Arc<DigestAuthenticator>,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(NONCE_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }

        let evicted = authenticator.nonces().evict_expired();

        if evicted > 0 {
            log::debug!("evicted {evicted} expired nonces");
        }
    }
}

/// Every 30s, ping the store and every relay instance and record the
/// observations
pub async fn health_probes(
    store: Arc<dyn KvStore>,
    relay: Arc<MediaRelayClient>,
    health: Arc<HealthState>,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(HEALTH_PROBE_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }

        match store.ping().await {
            Ok(()) => {
                health.record("kv-store", true, "reachable");
                health.record("session-store", true, "reachable");
            }
            Err(e) => {
                log::warn!("kv store health probe failed: {e}");
                health.record("kv-store", false, e.to_string());
                health.record("session-store", false, e.to_string());
            }
        }

        for instance in relay.instances() {
            let component = format!("relay:{}", instance.id);

            if !instance.is_enabled() {
                health.record(&component, true, "disabled");
                continue;
            }

            match relay.ping(instance).await {
                Ok(()) => health.record(&component, true, "pong"),
                Err(e) => {
                    log::warn!("relay instance {} failed its probe: {e}", instance.id);
                    health.record(&component, false, e.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn health_state_tracks_latest() {
        let health = HealthState::new();

        health.record("kv-store", true, "reachable");
        health.record("kv-store", false, "connection refused");

        let snapshot = health.snapshot();
        assert!(!snapshot["kv-store"].healthy);
        assert_eq!(snapshot["kv-store"].detail, "connection refused");
    }
}
