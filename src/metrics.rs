//! # Runtime Metrics
//!
//! Explicit metrics registry owned by whoever builds the service lifecycle and
//! handed to collaborators as `Arc<RuntimeMetrics>`. Every event is recorded
//! into OpenTelemetry instruments (exported by whatever meter provider the host
//! installs) and mirrored into in-process counters readable via
//! [`RuntimeMetrics::snapshot`].
//!
//! ## Usage
//!
//! ```rust
//! use plugin_runtime::metrics::{MessageStatus, RuntimeMetrics};
//! use std::time::Duration;
//!
//! let metrics = RuntimeMetrics::new();
//! metrics.record_message("dispatcher_js-sbom", MessageStatus::Success, Duration::from_millis(12));
//! assert_eq!(metrics.snapshot().messages["dispatcher_js-sbom"].success, 1);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter, UpDownCounter};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::time::Instant;

/// Outcome of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Success,
    Failure,
    Panic,
    /// Put back on the queue because a store or the broker was unreachable
    Requeued,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Panic => "panic",
            Self::Requeued => "requeued",
        }
    }
}

/// Outcome of one store liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthCheckStatus {
    Success,
    Failed,
    Timeout,
}

impl HealthCheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MessageCounts {
    pub success: u64,
    pub failure: u64,
    pub panic: u64,
    pub requeued: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthCheckCounts {
    pub success: u64,
    pub failed: u64,
    pub timeout: u64,
}

/// Connection counts of one store's pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolGauges {
    pub open: u32,
    pub idle: u32,
    pub in_use: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationCounts {
    pub success: u64,
    pub error: u64,
}

/// Point-in-time copy of the in-process counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub messages: HashMap<String, MessageCounts>,
    pub health_checks: HashMap<String, HealthCheckCounts>,
    pub component_health: HashMap<String, bool>,
    pub active_consumers: HashMap<String, i64>,
    pub database_operations: HashMap<String, OperationCounts>,
    pub pools: HashMap<String, PoolGauges>,
    pub uptime_secs: u64,
    pub restarts: u64,
    pub reconnect_attempts: u64,
    pub broker_connected: bool,
}

struct Instruments {
    messages_processed: Counter<u64>,
    message_duration: Histogram<f64>,
    health_checks: Counter<u64>,
    component_health: Gauge<u64>,
    restarts: Counter<u64>,
    reconnect_attempts: Counter<u64>,
    active_consumers: UpDownCounter<i64>,
    broker_connected: Gauge<u64>,
    database_operations: Counter<u64>,
    database_duration: Histogram<f64>,
    pool_connections: Gauge<u64>,
    uptime: Gauge<f64>,
}

impl Instruments {
    fn new(meter: &Meter) -> Self {
        Self {
            messages_processed: meter
                .u64_counter("plugin.messages.processed.total")
                .with_description("Deliveries processed, by queue and outcome")
                .build(),
            message_duration: meter
                .f64_histogram("plugin.message.duration")
                .with_description("Delivery processing duration in seconds")
                .with_unit("s")
                .build(),
            health_checks: meter
                .u64_counter("plugin.health_checks.total")
                .with_description("Store liveness probes, by store and outcome")
                .build(),
            component_health: meter
                .u64_gauge("plugin.component.healthy")
                .with_description("Component health (1=healthy, 0=unhealthy)")
                .build(),
            restarts: meter
                .u64_counter("plugin.service.restarts.total")
                .with_description("Successful reconnects after a health failure")
                .build(),
            reconnect_attempts: meter
                .u64_counter("plugin.service.reconnect_attempts.total")
                .with_description("Reconnect attempts, successful or not")
                .build(),
            active_consumers: meter
                .i64_up_down_counter("plugin.queue.consumers.active")
                .with_description("Running consumption loops per queue")
                .build(),
            broker_connected: meter
                .u64_gauge("plugin.broker.connected")
                .with_description("Broker connection state (1=connected, 0=disconnected)")
                .build(),
            database_operations: meter
                .u64_counter("plugin.database.operations.total")
                .with_description("Store operations, by operation and status")
                .build(),
            database_duration: meter
                .f64_histogram("plugin.database.operation.duration")
                .with_description("Store operation duration in seconds")
                .with_unit("s")
                .build(),
            pool_connections: meter
                .u64_gauge("plugin.database.pool.connections")
                .with_description("Pooled store connections, by store and state (open, idle, in_use)")
                .build(),
            uptime: meter
                .f64_gauge("plugin.service.uptime")
                .with_description("Time since the worker started, in seconds")
                .with_unit("s")
                .build(),
        }
    }
}

/// Metrics registry for one worker process
pub struct RuntimeMetrics {
    instruments: Instruments,
    messages: DashMap<String, MessageCounts>,
    health_checks: DashMap<String, HealthCheckCounts>,
    component_health: DashMap<String, bool>,
    active_consumers: DashMap<String, i64>,
    database_operations: DashMap<String, OperationCounts>,
    pools: DashMap<String, PoolGauges>,
    started: Instant,
    uptime_secs: AtomicU64,
    restarts: AtomicU64,
    reconnect_attempts: AtomicU64,
    broker_connected: AtomicBool,
}

impl std::fmt::Debug for RuntimeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeMetrics {
    /// Registry recording into the globally installed meter provider
    pub fn new() -> Self {
        Self::with_meter(opentelemetry::global::meter("plugin-runtime"))
    }

    pub fn with_meter(meter: Meter) -> Self {
        Self {
            instruments: Instruments::new(&meter),
            messages: DashMap::new(),
            health_checks: DashMap::new(),
            component_health: DashMap::new(),
            active_consumers: DashMap::new(),
            database_operations: DashMap::new(),
            pools: DashMap::new(),
            started: Instant::now(),
            uptime_secs: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            broker_connected: AtomicBool::new(false),
        }
    }

    pub fn record_message(&self, queue: &str, status: MessageStatus, duration: Duration) {
        let labels = [
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("status", status.as_str()),
        ];
        self.instruments.messages_processed.add(1, &labels);
        self.instruments
            .message_duration
            .record(duration.as_secs_f64(), &labels);

        let mut counts = self.messages.entry(queue.to_string()).or_default();
        match status {
            MessageStatus::Success => counts.success += 1,
            MessageStatus::Failure => counts.failure += 1,
            MessageStatus::Panic => counts.panic += 1,
            MessageStatus::Requeued => counts.requeued += 1,
        }
    }

    pub fn record_health_check(&self, store: &str, status: HealthCheckStatus) {
        self.instruments.health_checks.add(
            1,
            &[
                KeyValue::new("store", store.to_string()),
                KeyValue::new("status", status.as_str()),
            ],
        );

        let mut counts = self.health_checks.entry(store.to_string()).or_default();
        match status {
            HealthCheckStatus::Success => counts.success += 1,
            HealthCheckStatus::Failed => counts.failed += 1,
            HealthCheckStatus::Timeout => counts.timeout += 1,
        }
    }

    /// Components are `overall`, `broker` and `database_<store>`
    pub fn set_component_health(&self, component: &str, healthy: bool) {
        self.instruments.component_health.record(
            u64::from(healthy),
            &[KeyValue::new("component", component.to_string())],
        );
        self.component_health.insert(component.to_string(), healthy);
    }

    pub fn record_restart(&self) {
        self.instruments.restarts.add(1, &[]);
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self, succeeded: bool) {
        self.instruments.reconnect_attempts.add(
            1,
            &[KeyValue::new("status", if succeeded { "success" } else { "error" })],
        );
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consumer_started(&self, queue: &str) {
        self.adjust_consumers(queue, 1);
    }

    pub fn consumer_stopped(&self, queue: &str) {
        self.adjust_consumers(queue, -1);
    }

    fn adjust_consumers(&self, queue: &str, delta: i64) {
        self.instruments
            .active_consumers
            .add(delta, &[KeyValue::new("queue", queue.to_string())]);
        *self.active_consumers.entry(queue.to_string()).or_default() += delta;
    }

    pub fn set_broker_connected(&self, connected: bool) {
        self.instruments
            .broker_connected
            .record(u64::from(connected), &[]);
        self.broker_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_database_operation(&self, operation: &str, succeeded: bool, duration: Duration) {
        let labels = [
            KeyValue::new("operation", operation.to_string()),
            KeyValue::new("status", if succeeded { "success" } else { "error" }),
        ];
        self.instruments.database_operations.add(1, &labels);
        self.instruments
            .database_duration
            .record(duration.as_secs_f64(), &labels);

        let mut counts = self
            .database_operations
            .entry(operation.to_string())
            .or_default();
        if succeeded {
            counts.success += 1;
        } else {
            counts.error += 1;
        }
    }

    /// Publish the time elapsed since this registry was created
    pub fn record_uptime(&self) -> Duration {
        let uptime = self.started.elapsed();
        self.instruments.uptime.record(uptime.as_secs_f64(), &[]);
        self.uptime_secs.store(uptime.as_secs(), Ordering::Relaxed);
        uptime
    }

    /// `size` is the number of open connections, `idle` those not checked out
    pub fn set_pool_stats(&self, store: &str, size: u32, idle: u32) {
        let gauges = PoolGauges {
            open: size,
            idle,
            in_use: size.saturating_sub(idle),
        };
        for (state, value) in [
            ("open", gauges.open),
            ("idle", gauges.idle),
            ("in_use", gauges.in_use),
        ] {
            self.instruments.pool_connections.record(
                u64::from(value),
                &[
                    KeyValue::new("store", store.to_string()),
                    KeyValue::new("state", state),
                ],
            );
        }
        self.pools.insert(store.to_string(), gauges);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        fn copy<V: Copy>(map: &DashMap<String, V>) -> HashMap<String, V> {
            map.iter().map(|e| (e.key().clone(), *e.value())).collect()
        }

        MetricsSnapshot {
            messages: copy(&self.messages),
            health_checks: copy(&self.health_checks),
            component_health: copy(&self.component_health),
            active_consumers: copy(&self.active_consumers),
            database_operations: copy(&self.database_operations),
            pools: copy(&self.pools),
            uptime_secs: self.uptime_secs.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            broker_connected: self.broker_connected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_outcomes_per_queue() {
        let metrics = RuntimeMetrics::new();
        let d = Duration::from_millis(5);
        metrics.record_message("dispatcher_a", MessageStatus::Success, d);
        metrics.record_message("dispatcher_a", MessageStatus::Panic, d);
        metrics.record_message("dispatcher_b", MessageStatus::Failure, d);

        let snapshot = metrics.snapshot();
        assert_eq!(
            snapshot.messages["dispatcher_a"],
            MessageCounts {
                success: 1,
                failure: 0,
                panic: 1,
                requeued: 0
            }
        );
        assert_eq!(snapshot.messages["dispatcher_b"].failure, 1);
    }

    #[test]
    fn test_consumers_and_restarts() {
        let metrics = RuntimeMetrics::new();
        metrics.consumer_started("q");
        metrics.consumer_started("q");
        metrics.consumer_stopped("q");
        metrics.record_reconnect_attempt(false);
        metrics.record_reconnect_attempt(true);
        metrics.record_restart();
        metrics.set_component_health("overall", false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_consumers["q"], 1);
        assert_eq!(snapshot.reconnect_attempts, 2);
        assert_eq!(snapshot.restarts, 1);
        assert_eq!(snapshot.component_health["overall"], false);
    }

    #[test]
    fn test_health_and_database_counts() {
        let metrics = RuntimeMetrics::new();
        metrics.record_health_check("results", HealthCheckStatus::Success);
        metrics.record_health_check("results", HealthCheckStatus::Timeout);
        metrics.record_database_operation("update_step", true, Duration::from_millis(3));
        metrics.record_database_operation("update_step", false, Duration::from_millis(3));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.health_checks["results"].timeout, 1);
        assert_eq!(
            snapshot.database_operations["update_step"],
            OperationCounts {
                success: 1,
                error: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_and_pool_gauges() {
        let metrics = RuntimeMetrics::new();
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(metrics.record_uptime().as_secs(), 90);

        metrics.set_pool_stats("results", 5, 2);
        metrics.set_pool_stats("results", 4, 6);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.uptime_secs, 90);
        assert_eq!(
            snapshot.pools["results"],
            PoolGauges {
                open: 4,
                idle: 6,
                in_use: 0
            }
        );
    }
}
