//! Idle session eviction
//!
//! The reaper periodically sweeps the registry and removes sessions whose
//! last signaling activity is older than the configured timeout. Evicted
//! clients are not notified; they simply stop appearing in `ClientList`
//! and `ClientIp` answers.
//!
//! A timeout of zero disables eviction entirely.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use rdv_core::config::ServerConfig;
use rdv_core::Login;

use super::registry::SessionRegistry;

/// Shortest sweep interval; `tokio::time::interval` rejects zero
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Background task evicting idle sessions
pub struct Reaper {
    registry: Arc<SessionRegistry>,
    timeout: Duration,
    interval: Duration,
}

impl Reaper {
    /// Create a reaper with an explicit timeout and sweep interval.
    ///
    /// The interval is raised to at least one millisecond.
    pub fn new(registry: Arc<SessionRegistry>, timeout: Duration, interval: Duration) -> Self {
        if interval < MIN_INTERVAL {
            tracing::warn!(
                "Reaper interval {:?} too short, using {:?}",
                interval,
                MIN_INTERVAL
            );
        }

        Self {
            registry,
            timeout,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    /// Create a reaper from the server configuration
    pub fn from_config(registry: Arc<SessionRegistry>, config: &ServerConfig) -> Self {
        Self::new(registry, config.session_timeout, config.reap_interval)
    }

    /// Whether this reaper ever evicts anything
    pub fn is_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }

    /// Sweep once using the current time
    pub async fn sweep(&self) -> Vec<Login> {
        self.sweep_at(Instant::now()).await
    }

    /// Sweep once as of `now`
    pub async fn sweep_at(&self, now: Instant) -> Vec<Login> {
        if !self.is_enabled() {
            return Vec::new();
        }

        let evicted = self.registry.remove_idle(now, self.timeout).await;
        for session in &evicted {
            tracing::info!(
                login = %session.login,
                address = %session.address,
                idle = ?session.idle_for(now),
                "Evicting idle session"
            );
        }

        evicted.into_iter().map(|s| s.login).collect()
    }

    /// Run until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        if !self.is_enabled() {
            tracing::info!("Session timeout disabled, idle sessions are never evicted");
            cancel.cancelled().await;
            return;
        }

        tracing::info!(
            "Starting reaper (timeout: {:?}, check interval: {:?})",
            self.timeout,
            self.interval
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = self.sweep().await;
                    if !evicted.is_empty() {
                        tracing::debug!("Reaper evicted {} sessions", evicted.len());
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Reaper shutting down");
                    break;
                }
            }
        }
    }
}
