//! # Messaging Error Types
//!
//! Structured broker errors. Variants carry rendered strings so the errors stay
//! `Clone` and can cross task boundaries.

use thiserror::Error;

/// Broker and message-handling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Broker connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("Queue declaration failed: {queue_name}: {message}")]
    QueueDeclare { queue_name: String, message: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Consume failed: {queue_name}: {message}")]
    Consume { queue_name: String, message: String },

    #[error("Publish failed: {queue_name}: {message}")]
    Publish { queue_name: String, message: String },

    #[error("Acknowledgment failed: {queue_name}: delivery {delivery_tag}: {message}")]
    Acknowledge {
        queue_name: String,
        delivery_tag: u64,
        message: String,
    },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error: {message}")]
    MessageDeserialization { message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },
}

impl MessagingError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn connection_closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    pub fn queue_declare(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueDeclare {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    pub fn queue_not_found(queue_name: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    pub fn consume(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Consume {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    pub fn publish(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    pub fn acknowledge(
        queue_name: impl Into<String>,
        delivery_tag: u64,
        message: impl Into<String>,
    ) -> Self {
        Self::Acknowledge {
            queue_name: queue_name.into(),
            delivery_tag,
            message: message.into(),
        }
    }

    pub fn message_serialization(message: impl Into<String>) -> Self {
        Self::MessageSerialization {
            message: message.into(),
        }
    }

    pub fn message_deserialization(message: impl Into<String>) -> Self {
        Self::MessageDeserialization {
            message: message.into(),
        }
    }

    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether the error means the broker connection itself is gone
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::ConnectionClosed { .. })
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::message_deserialization(err.to_string())
        } else {
            Self::message_serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MessagingError::queue_declare("dispatcher_js-sbom", "access refused");
        assert_eq!(
            err.to_string(),
            "Queue declaration failed: dispatcher_js-sbom: access refused"
        );
        assert!(!err.is_connection_loss());
        assert!(MessagingError::connection_closed("server shutdown").is_connection_loss());
    }

    #[test]
    fn test_from_serde_error() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(
            MessagingError::from(err),
            MessagingError::MessageDeserialization { .. }
        ));
    }
}
