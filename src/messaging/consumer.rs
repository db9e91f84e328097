//! # Message Consumer
//!
//! One consumption loop per registered queue. Each delivery is handed to the
//! queue's [`QueueHandler`] inside its own task, so a handler that panics is
//! contained: its delivery is nack-requeued and the loop carries on.
//!
//! Settlement rules:
//!
//! | Handler outcome | Settlement | Recorded as |
//! |---|---|---|
//! | `Ok(())` | ack | success |
//! | `Err(HandlerError::Failed)` | ack | failure |
//! | `Err(HandlerError::Unavailable)` | nack with requeue after [`UNAVAILABLE_REQUEUE_DELAY`] | requeued |
//! | panic | nack with requeue | panic |
//!
//! A `Failed` return is a normal return: the handler has already dealt with the
//! failure (result row, step status), so the delivery is removed from the queue.
//! `Unavailable` means a store or the broker could not be reached. The work is
//! not done, so the delivery goes back on the queue and reconnecting is left to
//! the lifecycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::{Delivery, DeliveryStream};
use super::MessagingError;
use crate::database::Connections;
use crate::metrics::{MessageStatus, RuntimeMetrics};
use crate::resilience::StructuredError;

/// Pause before requeueing a delivery whose dependencies were unreachable
pub const UNAVAILABLE_REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// What a handler sees alongside the message body
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub queue: String,
    pub redelivered: bool,
    pub connections: Arc<Connections>,
    pub metrics: Arc<RuntimeMetrics>,
}

/// Why a handler did not complete a delivery
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HandlerError {
    /// Handled and recorded; the delivery is acked
    #[error("{0}")]
    Failed(StructuredError),
    /// A store or the broker could not be reached; the delivery is requeued
    #[error("dependency unavailable: {0}")]
    Unavailable(StructuredError),
}

impl HandlerError {
    pub fn unavailable(err: impl Into<StructuredError>) -> Self {
        Self::Unavailable(err.into())
    }

    pub fn error(&self) -> &StructuredError {
        match self {
            Self::Failed(err) | Self::Unavailable(err) => err,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<StructuredError> for HandlerError {
    fn from(err: StructuredError) -> Self {
        Self::Failed(err)
    }
}

/// Callback bound to a queue
#[async_trait]
pub trait QueueHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: HandlerContext, body: Vec<u8>) -> Result<(), HandlerError>;
}

/// A queue and the handler bound to it
///
/// Registrations live for the whole process and are replayed on every
/// reconnect.
#[derive(Clone)]
pub struct QueueRegistration {
    pub name: String,
    pub durable: bool,
    pub handler: Arc<dyn QueueHandler>,
}

impl std::fmt::Debug for QueueRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistration")
            .field("name", &self.name)
            .field("durable", &self.durable)
            .finish()
    }
}

/// How one delivery's handler invocation ended
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Completed,
    Failed(StructuredError),
    Requeued(StructuredError),
    Panicked(String),
}

impl HandlerOutcome {
    fn status(&self) -> MessageStatus {
        match self {
            HandlerOutcome::Completed => MessageStatus::Success,
            HandlerOutcome::Failed(_) => MessageStatus::Failure,
            HandlerOutcome::Requeued(_) => MessageStatus::Requeued,
            HandlerOutcome::Panicked(_) => MessageStatus::Panic,
        }
    }
}

/// Runs the consumption loops for every registered queue
pub struct MessageConsumer {
    prefetch: u16,
    metrics: Arc<RuntimeMetrics>,
    registrations: Vec<QueueRegistration>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
}

impl std::fmt::Debug for MessageConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("prefetch", &self.prefetch)
            .field("registrations", &self.registrations)
            .field("active", &self.active_consumers())
            .finish()
    }
}

impl MessageConsumer {
    pub fn new(prefetch: u16, metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            prefetch: prefetch.max(1),
            metrics,
            registrations: Vec::new(),
            loops: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind `handler` to `name`. Registering a name twice replaces the handler.
    pub fn register_queue(
        &mut self,
        name: impl Into<String>,
        durable: bool,
        handler: Arc<dyn QueueHandler>,
    ) -> &mut Self {
        let name = name.into();
        self.registrations.retain(|r| r.name != name);
        info!(queue = %name, durable, "Queue registered");
        self.registrations.push(QueueRegistration {
            name,
            durable,
            handler,
        });
        self
    }

    pub fn registrations(&self) -> &[QueueRegistration] {
        &self.registrations
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    /// Number of consumption loops currently running
    pub fn active_consumers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Declare every registered queue on `connections`' broker and start one
    /// consumption loop per queue
    ///
    /// Loops from an earlier generation are stopped first. All queues are
    /// declared and subscribed before any loop starts, so an error leaves
    /// nothing running.
    pub async fn start_listening(&self, connections: Arc<Connections>) -> Result<(), MessagingError> {
        self.stop();

        let broker = connections.broker().clone();
        let mut streams = Vec::with_capacity(self.registrations.len());
        for registration in &self.registrations {
            broker
                .declare_queue(&registration.name, registration.durable)
                .await?;
            let stream = broker.consume(&registration.name, self.prefetch).await?;
            streams.push((registration.clone(), stream));
        }

        let mut loops = self.loops.lock();
        for (registration, stream) in streams {
            info!(
                queue = %registration.name,
                prefetch = self.prefetch,
                provider = broker.provider_name(),
                "Starting consumption loop"
            );
            loops.push(tokio::spawn(consume_loop(
                registration,
                stream,
                connections.clone(),
                self.metrics.clone(),
                self.active.clone(),
            )));
        }
        Ok(())
    }

    /// Abort every consumption loop. In-flight handler tasks run to completion.
    pub fn stop(&self) {
        let loops = std::mem::take(&mut *self.loops.lock());
        if !loops.is_empty() {
            debug!(count = loops.len(), "Stopping consumption loops");
        }
        for handle in loops {
            handle.abort();
        }
    }
}

impl Drop for MessageConsumer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Keeps the running-loop bookkeeping right however the loop exits
struct LoopGuard {
    queue: String,
    metrics: Arc<RuntimeMetrics>,
    active: Arc<AtomicUsize>,
}

impl LoopGuard {
    fn enter(queue: &str, metrics: Arc<RuntimeMetrics>, active: Arc<AtomicUsize>) -> Self {
        metrics.consumer_started(queue);
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            queue: queue.to_string(),
            metrics,
            active,
        }
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.metrics.consumer_stopped(&self.queue);
    }
}

async fn consume_loop(
    registration: QueueRegistration,
    mut stream: DeliveryStream,
    connections: Arc<Connections>,
    metrics: Arc<RuntimeMetrics>,
    active: Arc<AtomicUsize>,
) {
    let _guard = LoopGuard::enter(&registration.name, metrics.clone(), active);

    while let Some(next) = stream.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) if e.is_connection_loss() => {
                warn!(queue = %registration.name, error = %e, "Delivery stream lost its connection");
                break;
            }
            Err(e) => {
                warn!(queue = %registration.name, error = %e, "Delivery stream error");
                continue;
            }
        };

        let ctx = HandlerContext {
            queue: registration.name.clone(),
            redelivered: delivery.redelivered,
            connections: connections.clone(),
            metrics: metrics.clone(),
        };
        tokio::spawn(process_delivery(
            delivery,
            registration.handler.clone(),
            ctx,
        ));
    }

    info!(queue = %registration.name, "Consumption loop ended");
}

/// Run `handler` on one delivery, settle it and record the outcome
pub async fn process_delivery(
    mut delivery: Delivery,
    handler: Arc<dyn QueueHandler>,
    ctx: HandlerContext,
) -> HandlerOutcome {
    let start = Instant::now();
    let queue = delivery.queue.clone();
    let delivery_tag = delivery.delivery_tag;
    let metrics = ctx.metrics.clone();
    let body = std::mem::take(&mut delivery.body);

    debug!(queue = %queue, delivery_tag, redelivered = delivery.redelivered, "Delivery received");

    // The inner task is the fault boundary: a panic surfaces as a JoinError
    let outcome = match tokio::spawn(async move { handler.handle(ctx, body).await }).await {
        Ok(Ok(())) => HandlerOutcome::Completed,
        Ok(Err(HandlerError::Failed(err))) => HandlerOutcome::Failed(err),
        Ok(Err(HandlerError::Unavailable(err))) => HandlerOutcome::Requeued(err),
        Err(join_err) if join_err.is_panic() => {
            HandlerOutcome::Panicked(panic_message(join_err.into_panic()))
        }
        Err(join_err) => HandlerOutcome::Panicked(join_err.to_string()),
    };

    let settled = match &outcome {
        HandlerOutcome::Completed | HandlerOutcome::Failed(_) => delivery.ack().await,
        HandlerOutcome::Requeued(_) => {
            tokio::time::sleep(UNAVAILABLE_REQUEUE_DELAY).await;
            delivery.nack_requeue().await
        }
        HandlerOutcome::Panicked(_) => delivery.nack_requeue().await,
    };

    let elapsed = start.elapsed();
    metrics.record_message(&queue, outcome.status(), elapsed);

    match &outcome {
        HandlerOutcome::Completed => debug!(
            queue = %queue,
            delivery_tag,
            duration_ms = elapsed.as_millis() as u64,
            "Delivery processed"
        ),
        HandlerOutcome::Failed(err) => warn!(
            queue = %queue,
            delivery_tag,
            duration_ms = elapsed.as_millis() as u64,
            error = %err,
            category = %err.category,
            "Handler returned an error"
        ),
        HandlerOutcome::Requeued(err) => warn!(
            queue = %queue,
            delivery_tag,
            duration_ms = elapsed.as_millis() as u64,
            error = %err,
            "Dependency unavailable, delivery requeued"
        ),
        HandlerOutcome::Panicked(message) => error!(
            queue = %queue,
            delivery_tag,
            duration_ms = elapsed.as_millis() as u64,
            panic = %message,
            "Handler panicked, delivery requeued"
        ),
    }

    if let Err(e) = settled {
        warn!(queue = %queue, delivery_tag, error = %e, "Failed to settle delivery");
    }
    outcome
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<&'static str>() {
        Ok(message) => (*message).to_string(),
        Err(payload) => match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(_) => "handler panicked".to_string(),
        },
    }
}
