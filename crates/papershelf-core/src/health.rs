//! Backend reachability monitor.
//!
//! Keeps a cached boolean that gates uploads and syncs. The cache starts
//! optimistic so a session is usable before the first poll completes; a
//! gate check on an unhealthy cache re-probes once, so recovery is
//! observed on the next user action rather than the next poll tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::PersistenceBridge;

pub struct HealthMonitor {
    bridge: Arc<dyn PersistenceBridge>,
    healthy: AtomicBool,
}

impl HealthMonitor {
    pub fn new(bridge: Arc<dyn PersistenceBridge>) -> Self {
        Self {
            bridge,
            healthy: AtomicBool::new(true),
        }
    }

    /// Last probe result without touching the network.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Probe the backend and update the cache.
    pub async fn probe(&self) -> bool {
        let healthy = self.bridge.get_health().await;
        self.healthy.store(healthy, Ordering::SeqCst);
        if !healthy {
            tracing::warn!("backend health probe failed");
        }
        healthy
    }

    /// Gate check for writes. A healthy cache is trusted as-is; an
    /// unhealthy one triggers one fresh probe so a recovered backend is
    /// usable immediately.
    pub async fn ensure_healthy(&self) -> bool {
        if self.is_healthy() {
            return true;
        }
        self.probe().await
    }

    /// Background poll loop. Runs until the token is cancelled.
    pub fn spawn_poller(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.probe().await;
                    }
                }
            }
        })
    }
}
