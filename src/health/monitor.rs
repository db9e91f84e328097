//! # Health Monitor
//!
//! Watches one connection generation. Every `interval` it pings each store with
//! its own `ping_timeout`; between ticks it listens for the broker connection
//! going away. The first failure from either source is sent once on the
//! returned channel and the monitor stops. A new monitor is started for every
//! new generation.
//!
//! A ping that outlives its timeout is dropped, not left running.
//!
//! Each tick also refreshes the service uptime gauge and the pool occupancy of
//! every store that reports one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::database::Connections;
use crate::messaging::ConnectionState;
use crate::metrics::{HealthCheckStatus, RuntimeMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    /// Time between store check rounds
    pub interval: Duration,
    /// Deadline for each individual store ping
    pub ping_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

/// Why a generation was declared unhealthy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthFailure {
    StorePing { store: String, reason: String },
    StoreTimeout { store: String, timeout: Duration },
    BrokerConnectionLost { reason: String },
}

impl fmt::Display for HealthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthFailure::StorePing { store, reason } => {
                write!(f, "store {store} ping failed: {reason}")
            }
            HealthFailure::StoreTimeout { store, timeout } => {
                write!(f, "store {store} ping timed out after {}ms", timeout.as_millis())
            }
            HealthFailure::BrokerConnectionLost { reason } => {
                write!(f, "broker connection lost: {reason}")
            }
        }
    }
}

pub struct HealthMonitor {
    connections: Arc<Connections>,
    config: HealthConfig,
    metrics: Arc<RuntimeMetrics>,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("stores", &self.connections.stores().len())
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(
        connections: Arc<Connections>,
        config: HealthConfig,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            connections,
            config,
            metrics,
        }
    }

    /// Spawn the monitor loop
    ///
    /// The receiver resolves with the first failure. It resolves with an error
    /// instead if the monitor ends without one: the broker connection was
    /// closed on purpose, or the task was aborted.
    pub fn spawn(self) -> (JoinHandle<()>, oneshot::Receiver<HealthFailure>) {
        let (tx, rx) = oneshot::channel();
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            ping_timeout_ms = self.config.ping_timeout.as_millis() as u64,
            stores = self.connections.stores().len(),
            "Starting health monitor"
        );

        let handle = tokio::spawn(async move {
            match self.run().await {
                Some(failure) => {
                    error!(failure = %failure, "Health check failed, signalling lifecycle");
                    self.metrics.set_component_health("overall", false);
                    // The lifecycle may already be gone during shutdown
                    let _ = tx.send(failure);
                }
                None => debug!("Health monitor stopped, broker connection closed"),
            }
        });
        (handle, rx)
    }

    /// Start a monitor for `connections`
    pub fn start(
        connections: Arc<Connections>,
        config: HealthConfig,
        metrics: Arc<RuntimeMetrics>,
    ) -> (JoinHandle<()>, oneshot::Receiver<HealthFailure>) {
        Self::new(connections, config, metrics).spawn()
    }

    async fn run(&self) -> Option<HealthFailure> {
        let mut broker_state = self.connections.broker().state();
        let initial = broker_state.borrow_and_update().clone();
        if let Some(outcome) = self.broker_outcome(&initial) {
            return outcome;
        }

        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.record_gauges();
                    if let Err(failure) = self.check_stores().await {
                        return Some(failure);
                    }
                }
                changed = broker_state.changed() => {
                    if changed.is_err() {
                        return Some(self.broker_lost("connection state channel dropped".to_string()));
                    }
                    let state = broker_state.borrow_and_update().clone();
                    if let Some(outcome) = self.broker_outcome(&state) {
                        return outcome;
                    }
                }
            }
        }
    }

    /// `None` while the broker connection is open
    fn broker_outcome(&self, state: &ConnectionState) -> Option<Option<HealthFailure>> {
        match state {
            ConnectionState::Open => None,
            ConnectionState::Closed => Some(None),
            ConnectionState::Failed(reason) => Some(Some(self.broker_lost(reason.clone()))),
        }
    }

    fn broker_lost(&self, reason: String) -> HealthFailure {
        warn!(reason = %reason, "Broker connection lost");
        self.metrics.set_broker_connected(false);
        self.metrics.set_component_health("broker", false);
        HealthFailure::BrokerConnectionLost { reason }
    }

    fn record_gauges(&self) {
        self.metrics.record_uptime();
        for store in self.connections.stores() {
            if let Some(stats) = store.pool_stats() {
                self.metrics.set_pool_stats(store.name(), stats.size, stats.idle);
            }
        }
    }

    /// Ping every store once, stopping at the first failure
    pub async fn check_stores(&self) -> Result<(), HealthFailure> {
        for store in self.connections.stores() {
            let name = store.name().to_string();
            let component = format!("database_{name}");

            match tokio::time::timeout(self.config.ping_timeout, store.ping()).await {
                Ok(Ok(())) => {
                    debug!(store = %name, "Store healthy");
                    self.metrics.record_health_check(&name, HealthCheckStatus::Success);
                    self.metrics.set_component_health(&component, true);
                }
                Ok(Err(e)) => {
                    warn!(store = %name, error = %e, "Store ping failed");
                    self.metrics.record_health_check(&name, HealthCheckStatus::Failed);
                    self.metrics.set_component_health(&component, false);
                    return Err(HealthFailure::StorePing {
                        store: name,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    warn!(
                        store = %name,
                        timeout_ms = self.config.ping_timeout.as_millis() as u64,
                        "Store ping timed out"
                    );
                    self.metrics.record_health_check(&name, HealthCheckStatus::Timeout);
                    self.metrics.set_component_health(&component, false);
                    return Err(HealthFailure::StoreTimeout {
                        store: name,
                        timeout: self.config.ping_timeout,
                    });
                }
            }
        }
        self.metrics.set_component_health("overall", true);
        Ok(())
    }
}
