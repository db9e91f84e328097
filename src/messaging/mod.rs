//! # Messaging
//!
//! Broker abstraction with RabbitMQ and in-memory providers, the dispatcher
//! wire messages, and the per-queue [`MessageConsumer`].

pub mod broker;
pub mod consumer;
pub mod errors;
pub mod in_memory;
pub mod messages;
pub mod rabbitmq;

pub use broker::{BrokerConnection, ConnectionState, Delivery, DeliveryAcker, DeliveryStream};
pub use consumer::{
    process_delivery, HandlerContext, HandlerError, HandlerOutcome, MessageConsumer,
    QueueHandler, QueueRegistration, UNAVAILABLE_REQUEUE_DELAY,
};
pub use errors::MessagingError;
pub use messages::{
    dispatcher_queue_name, CompletionMessage, DispatchMessage, PLUGINS_DISPATCHER_QUEUE,
};
