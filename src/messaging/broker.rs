//! # Broker Abstraction
//!
//! Provider-agnostic view of the single broker connection a worker holds.
//! Providers implement [`BrokerConnection`]; deliveries carry their own acker so
//! settling is tied to the delivery value and can happen at most once.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::watch;

use super::MessagingError;

/// Observable state of a broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// Closed by this process
    Closed,
    /// Closed by the broker or the network
    Failed(String),
}

/// Provider hook used to settle one delivery
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), MessagingError>;
    async fn nack_requeue(&self) -> Result<(), MessagingError>;
}

/// One unit of work received from a queue
pub struct Delivery {
    pub queue: String,
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub redelivered: bool,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(
        queue: impl Into<String>,
        body: Vec<u8>,
        delivery_tag: u64,
        redelivered: bool,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            queue: queue.into(),
            body,
            delivery_tag,
            redelivered,
            acker,
        }
    }

    /// Remove the delivery from the queue permanently
    pub async fn ack(self) -> Result<(), MessagingError> {
        self.acker.ack().await
    }

    /// Return the delivery to the queue for redelivery
    pub async fn nack_requeue(self) -> Result<(), MessagingError> {
        self.acker.nack_requeue().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, MessagingError>>;

/// A live connection to the message broker
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Provider name for logs and metrics
    fn provider_name(&self) -> &'static str;

    /// Declare `queue`, creating it if absent
    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<(), MessagingError>;

    /// Start consuming `queue` with at most `prefetch` unacknowledged deliveries
    ///
    /// The stream ends when the connection closes.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, MessagingError>;

    /// Publish a persistent message to `queue` through the default exchange
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), MessagingError>;

    /// Watch for connection state changes
    fn state(&self) -> watch::Receiver<ConnectionState>;

    fn is_connected(&self) -> bool {
        matches!(*self.state().borrow(), ConnectionState::Open)
    }

    async fn close(&self) -> Result<(), MessagingError>;
}
