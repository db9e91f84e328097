//! # Service Lifecycle State Machine
//!
//! Owns the message consumer and drives it across connection generations.
//! Startup failures are returned to the caller. Once listening, connectivity
//! loss is never fatal: the lifecycle tears the generation down, waits, and
//! reconnects until it succeeds or a termination signal arrives.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Connector, LifecycleState};
use crate::database::Connections;
use crate::errors::RuntimeResult;
use crate::health::{HealthConfig, HealthFailure, HealthMonitor};
use crate::messaging::MessageConsumer;
use crate::metrics::RuntimeMetrics;
use crate::models::PluginDescriptor;

/// Reconnect timing and health monitor settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Wait after tearing down an unhealthy generation
    pub cooldown: Duration,
    /// Wait after the first failed reconnect, doubled after each further failure
    pub reconnect_backoff: Duration,
    pub max_backoff: Duration,
    pub health: HealthConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(5 * 60),
            health: HealthConfig::default(),
        }
    }
}

impl LifecycleConfig {
    /// Wait before the next reconnect attempt after `failures` failed attempts
    pub fn reconnect_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.cooldown;
        }
        let factor = 2u32.checked_pow(failures - 1).unwrap_or(u32::MAX);
        self.reconnect_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// One connection generation and the monitor watching it
struct Generation {
    connections: Arc<Connections>,
    monitor: JoinHandle<()>,
    health: oneshot::Receiver<HealthFailure>,
}

enum ListenEvent {
    Shutdown,
    Unhealthy(Option<HealthFailure>),
}

pub struct ServiceLifecycle<C: Connector> {
    connector: C,
    consumer: MessageConsumer,
    metrics: Arc<RuntimeMetrics>,
    config: LifecycleConfig,
    descriptors: Vec<PluginDescriptor>,
    state: watch::Sender<LifecycleState>,
}

impl<C: Connector> std::fmt::Debug for ServiceLifecycle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceLifecycle")
            .field("state", &*self.state.borrow())
            .field("consumer", &self.consumer)
            .field("config", &self.config)
            .finish()
    }
}

impl<C: Connector> ServiceLifecycle<C> {
    pub fn new(
        connector: C,
        consumer: MessageConsumer,
        metrics: Arc<RuntimeMetrics>,
        config: LifecycleConfig,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::Starting);
        Self {
            connector,
            consumer,
            metrics,
            config,
            descriptors: Vec::new(),
            state,
        }
    }

    /// Register `descriptor` in the plugins store after the first successful
    /// connect, unless a plugin with that name is already registered
    pub fn with_plugin_descriptor(mut self, descriptor: PluginDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn consumer(&self) -> &MessageConsumer {
        &self.consumer
    }

    /// Run until `shutdown` resolves
    ///
    /// Returns an error only when the initial connect fails.
    pub async fn run<F>(self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        self.transition(LifecycleState::Starting);
        let mut generation = match self.start_generation().await {
            Ok(generation) => generation,
            Err(e) => {
                error!(error = %e, "Startup failed");
                self.transition(LifecycleState::Shutdown);
                return Err(e);
            }
        };
        self.register_plugins(&generation.connections).await;

        loop {
            self.transition(LifecycleState::Listening);

            let event = tokio::select! {
                _ = &mut shutdown => ListenEvent::Shutdown,
                failure = &mut generation.health => ListenEvent::Unhealthy(failure.ok()),
            };

            match event {
                ListenEvent::Shutdown => break,
                ListenEvent::Unhealthy(failure) => {
                    match &failure {
                        Some(failure) => warn!(failure = %failure, "Connection generation unhealthy"),
                        None => warn!("Health monitor ended without a verdict"),
                    }
                    self.transition(LifecycleState::Reconnecting);
                    self.teardown(generation).await;

                    match self.reconnect(&mut shutdown).await {
                        Some(next) => generation = next,
                        None => {
                            self.transition(LifecycleState::Draining);
                            self.consumer.stop();
                            self.transition(LifecycleState::Shutdown);
                            return Ok(());
                        }
                    }
                }
            }
        }

        info!("Shutdown signal received, draining");
        self.transition(LifecycleState::Draining);
        self.teardown(generation).await;
        self.transition(LifecycleState::Shutdown);
        Ok(())
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Lifecycle transition");
        }
    }

    async fn start_generation(&self) -> RuntimeResult<Generation> {
        let connections = self.connector.connect().await?;

        if let Err(e) = self.consumer.start_listening(connections.clone()).await {
            self.consumer.stop();
            connections.close().await;
            return Err(e.into());
        }
        self.metrics.set_broker_connected(true);
        self.metrics.set_component_health("broker", true);

        let (monitor, health) =
            HealthMonitor::start(connections.clone(), self.config.health, self.metrics.clone());

        info!(
            queues = self.consumer.registrations().len(),
            stores = connections.stores().len(),
            "Connection generation started"
        );
        Ok(Generation {
            connections,
            monitor,
            health,
        })
    }

    async fn teardown(&self, generation: Generation) {
        generation.monitor.abort();
        self.consumer.stop();
        generation.connections.close().await;
        self.metrics.set_broker_connected(false);
        debug!("Connection generation torn down");
    }

    /// Keep trying until a generation starts. `None` if `shutdown` fired first.
    ///
    /// A shutdown arriving mid-attempt lets the attempt finish, and anything it
    /// opened is torn down before returning.
    async fn reconnect<F>(&self, shutdown: &mut Pin<&mut F>) -> Option<Generation>
    where
        F: Future<Output = ()> + Send,
    {
        let mut failures = 0u32;
        loop {
            let delay = self.config.reconnect_delay(failures);
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = failures + 1,
                "Waiting before reconnect"
            );

            tokio::select! {
                _ = shutdown.as_mut() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let connecting = self.start_generation();
            tokio::pin!(connecting);
            let attempt = tokio::select! {
                _ = shutdown.as_mut() => {
                    info!("Shutdown signal received during reconnect attempt");
                    self.transition(LifecycleState::Draining);
                    if let Ok(generation) = connecting.await {
                        self.teardown(generation).await;
                    }
                    return None;
                }
                attempt = &mut connecting => attempt,
            };

            match attempt {
                Ok(generation) => {
                    self.metrics.record_reconnect_attempt(true);
                    self.metrics.record_restart();
                    info!(attempts = failures + 1, "Reconnected");
                    return Some(generation);
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    self.metrics.record_reconnect_attempt(false);
                    error!(error = %e, failures, "Reconnect attempt failed");
                }
            }
        }
    }

    async fn register_plugins(&self, connections: &Connections) {
        for descriptor in &self.descriptors {
            match connections.plugins().register_if_absent(descriptor).await {
                Ok(true) => info!(
                    plugin = %descriptor.name,
                    version = %descriptor.version,
                    "Plugin registered"
                ),
                Ok(false) => debug!(plugin = %descriptor.name, "Plugin already registered"),
                Err(e) => warn!(
                    plugin = %descriptor.name,
                    error = %e,
                    "Plugin registration failed, continuing"
                ),
            }
        }
    }
}
