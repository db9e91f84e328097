//! # In-Memory Broker
//!
//! Broker used by tests and local development. An [`InMemoryBroker`] plays the
//! server: its queues outlive individual connections, so a worker can lose its
//! connection, reconnect, and find its work still queued.
//!
//! Semantics follow AMQP closely enough for the runtime:
//! - FIFO per queue, prefetch bounds unacknowledged deliveries per consumer
//! - nack-with-requeue puts the message back at the head, flagged redelivered
//! - a delivery dropped without being settled, or settled after its connection
//!   closed, is requeued the same way
//! - consume streams end when their connection closes

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::broker::{BrokerConnection, ConnectionState, Delivery, DeliveryAcker, DeliveryStream};
use super::MessagingError;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    durable: bool,
    consumers: usize,
    total_published: u64,
    total_acked: u64,
    total_nacked: u64,
}

#[derive(Debug, Default)]
struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl InMemoryQueue {
    fn push_back(&self, body: Vec<u8>) {
        {
            let mut state = self.state.lock();
            state.messages.push_back(StoredMessage {
                body,
                redelivered: false,
            });
            state.total_published += 1;
        }
        self.notify.notify_one();
    }

    fn requeue(&self, mut message: StoredMessage) {
        message.redelivered = true;
        self.state.lock().messages.push_front(message);
        self.notify.notify_one();
    }

    async fn next_message(&self) -> StoredMessage {
        loop {
            let notified = self.notify.notified();
            let next = self.state.lock().messages.pop_front();
            if let Some(message) = next {
                return message;
            }
            notified.await;
        }
    }
}

/// Snapshot of one queue's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InMemoryQueueStats {
    pub depth: usize,
    pub consumers: usize,
    pub durable: bool,
    pub total_published: u64,
    pub total_acked: u64,
    pub total_nacked: u64,
}

/// Shared in-process broker
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, Arc<InMemoryQueue>>>,
    connections: Mutex<Vec<Arc<watch::Sender<ConnectionState>>>>,
    refuse_connections: AtomicU32,
    connect_attempts: AtomicU32,
    next_delivery_tag: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a new client connection
    pub fn connect(self: &Arc<Self>) -> Result<InMemoryConnection, MessagingError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(MessagingError::connection("connection refused"));
        }

        let (tx, rx) = watch::channel(ConnectionState::Open);
        let tx = Arc::new(tx);
        let mut connections = self.connections.lock();
        connections.retain(|c| matches!(*c.borrow(), ConnectionState::Open));
        connections.push(tx.clone());

        Ok(InMemoryConnection {
            broker: self.clone(),
            state_tx: tx,
            state_rx: rx,
        })
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_next_connections(&self, count: u32) {
        self.refuse_connections.store(count, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Drop every open client connection, as a broker restart would
    pub fn sever(&self, reason: &str) {
        let connections = std::mem::take(&mut *self.connections.lock());
        debug!(reason = %reason, count = connections.len(), "Severing in-memory connections");
        for tx in connections {
            tx.send_replace(ConnectionState::Failed(reason.to_string()));
        }
    }

    /// Publish without a client connection (test setup)
    pub fn publish(&self, queue: &str, payload: &[u8]) {
        self.queue_or_create(queue, true).push_back(payload.to_vec());
    }

    /// Remove and return every ready message on `queue`
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        match self.queues.lock().get(queue) {
            Some(q) => q.state.lock().messages.drain(..).map(|m| m.body).collect(),
            None => Vec::new(),
        }
    }

    pub fn queue_stats(&self, queue: &str) -> Option<InMemoryQueueStats> {
        let queue = self.queues.lock().get(queue).cloned()?;
        let state = queue.state.lock();
        Some(InMemoryQueueStats {
            depth: state.messages.len(),
            consumers: state.consumers,
            durable: state.durable,
            total_published: state.total_published,
            total_acked: state.total_acked,
            total_nacked: state.total_nacked,
        })
    }

    fn queue(&self, name: &str) -> Option<Arc<InMemoryQueue>> {
        self.queues.lock().get(name).cloned()
    }

    fn queue_or_create(&self, name: &str, durable: bool) -> Arc<InMemoryQueue> {
        self.queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                let queue = InMemoryQueue::default();
                queue.state.lock().durable = durable;
                Arc::new(queue)
            })
            .clone()
    }

    fn next_tag(&self) -> u64 {
        self.next_delivery_tag.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Client connection to an [`InMemoryBroker`]
#[derive(Debug)]
pub struct InMemoryConnection {
    broker: Arc<InMemoryBroker>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl InMemoryConnection {
    fn ensure_open(&self) -> Result<(), MessagingError> {
        match &*self.state_rx.borrow() {
            ConnectionState::Open => Ok(()),
            ConnectionState::Closed => Err(MessagingError::connection_closed("closed by client")),
            ConnectionState::Failed(reason) => Err(MessagingError::connection_closed(reason)),
        }
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn provider_name(&self) -> &'static str {
        "in_memory"
    }

    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<(), MessagingError> {
        self.ensure_open()?;
        self.broker.queue_or_create(queue, durable);
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, MessagingError> {
        self.ensure_open()?;
        let target = self
            .broker
            .queue(queue)
            .ok_or_else(|| MessagingError::queue_not_found(queue))?;
        target.state.lock().consumers += 1;

        let consumer = Consumer {
            queue_name: queue.to_string(),
            queue: target,
            broker: self.broker.clone(),
            permits: Arc::new(Semaphore::new(usize::from(prefetch.max(1)))),
            state: self.state_rx.clone(),
        };

        let stream = futures::stream::unfold(consumer, |mut consumer| async move {
            let delivery = consumer.next_delivery().await?;
            Some((Ok::<_, MessagingError>(delivery), consumer))
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), MessagingError> {
        self.ensure_open()?;
        self.broker
            .queue_or_create(queue, true)
            .push_back(payload.to_vec());
        Ok(())
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.state_tx.send_if_modified(|state| {
            if matches!(state, ConnectionState::Open) {
                *state = ConnectionState::Closed;
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

struct Consumer {
    queue_name: String,
    queue: Arc<InMemoryQueue>,
    broker: Arc<InMemoryBroker>,
    permits: Arc<Semaphore>,
    state: watch::Receiver<ConnectionState>,
}

impl Consumer {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit.ok()?,
            _ = wait_for_close(&mut self.state) => return None,
        };
        let message = tokio::select! {
            message = self.queue.next_message() => message,
            _ = wait_for_close(&mut self.state) => return None,
        };

        let acker = InMemoryAcker {
            queue_name: self.queue_name.clone(),
            queue: self.queue.clone(),
            message: message.clone(),
            settled: AtomicBool::new(false),
            connection: self.state.clone(),
            _permit: permit,
        };
        Some(Delivery::new(
            self.queue_name.clone(),
            message.body,
            self.broker.next_tag(),
            message.redelivered,
            Box::new(acker),
        ))
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock();
        state.consumers = state.consumers.saturating_sub(1);
    }
}

async fn wait_for_close(state: &mut watch::Receiver<ConnectionState>) {
    loop {
        if !matches!(*state.borrow_and_update(), ConnectionState::Open) {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

struct InMemoryAcker {
    queue_name: String,
    queue: Arc<InMemoryQueue>,
    message: StoredMessage,
    settled: AtomicBool,
    connection: watch::Receiver<ConnectionState>,
    _permit: OwnedSemaphorePermit,
}

impl InMemoryAcker {
    fn begin_settle(&self) -> Result<(), MessagingError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(MessagingError::acknowledge(
                &self.queue_name,
                0,
                "delivery already settled",
            ));
        }
        if !matches!(*self.connection.borrow(), ConnectionState::Open) {
            self.queue.requeue(self.message.clone());
            return Err(MessagingError::connection_closed(
                "connection closed before settle",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn ack(&self) -> Result<(), MessagingError> {
        self.begin_settle()?;
        self.queue.state.lock().total_acked += 1;
        Ok(())
    }

    async fn nack_requeue(&self) -> Result<(), MessagingError> {
        self.begin_settle()?;
        self.queue.state.lock().total_nacked += 1;
        self.queue.requeue(self.message.clone());
        Ok(())
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            self.queue.requeue(self.message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().unwrap();
        conn.declare_queue("dispatcher_js-sbom", true).await.unwrap();
        conn.publish("dispatcher_js-sbom", b"one").await.unwrap();
        conn.publish("dispatcher_js-sbom", b"two").await.unwrap();

        let mut stream = conn.consume("dispatcher_js-sbom", 10).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.body, b"one");
        assert_eq!(second.body, b"two");

        first.ack().await.unwrap();
        second.ack().await.unwrap();

        let stats = broker.queue_stats("dispatcher_js-sbom").unwrap();
        assert_eq!(stats.depth, 0);
        assert_eq!(stats.total_acked, 2);
        assert_eq!(stats.consumers, 1);
    }

    #[tokio::test]
    async fn test_nack_requeues_at_head() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().unwrap();
        conn.declare_queue("q", true).await.unwrap();
        conn.publish("q", b"a").await.unwrap();
        conn.publish("q", b"b").await.unwrap();

        let mut stream = conn.consume("q", 1).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.nack_requeue().await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.body, b"a");
        assert!(again.redelivered);
        assert_eq!(broker.queue_stats("q").unwrap().total_nacked, 1);
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().unwrap();
        conn.declare_queue("q", true).await.unwrap();
        for body in [b"1", b"2", b"3"] {
            conn.publish("q", body).await.unwrap();
        }

        let mut stream = conn.consume("q", 2).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let _second = stream.next().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err(), "third delivery must wait for a settle");

        first.ack().await.unwrap();
        let third = stream.next().await.unwrap().unwrap();
        assert_eq!(third.body, b"3");
    }

    #[tokio::test]
    async fn test_sever_ends_streams_and_keeps_messages() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().unwrap();
        conn.declare_queue("q", true).await.unwrap();
        conn.publish("q", b"pending").await.unwrap();

        let mut stream = conn.consume("q", 1).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        broker.sever("broker restart");
        assert!(stream.next().await.is_none());
        assert!(!conn.is_connected());

        let err = delivery.ack().await.unwrap_err();
        assert!(err.is_connection_loss());
        drop(stream);

        let stats = broker.queue_stats("q").unwrap();
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.consumers, 0);

        let conn = broker.connect().unwrap();
        let mut stream = conn.consume("q", 1).await.unwrap();
        let redelivered = stream.next().await.unwrap().unwrap();
        assert_eq!(redelivered.body, b"pending");
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn test_refused_connections() {
        let broker = InMemoryBroker::new();
        broker.refuse_next_connections(2);
        assert!(broker.connect().is_err());
        assert!(broker.connect().is_err());
        assert!(broker.connect().is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_consume_unknown_queue() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().unwrap();
        let err = conn.consume("missing", 1).await.err().unwrap();
        assert_eq!(err, MessagingError::queue_not_found("missing"));
    }
}
