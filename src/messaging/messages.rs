//! Wire messages exchanged with the dispatcher.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::MessagingError;

/// Queue the dispatcher consumes completion notifications from
pub const PLUGINS_DISPATCHER_QUEUE: &str = "plugins_dispatcher";

/// Inbound work queue of a plugin
pub fn dispatcher_queue_name(plugin: &str) -> String {
    format!("dispatcher_{plugin}")
}

/// Unit of work sent by the dispatcher to a plugin
///
/// `data` is the plugin-specific configuration blob. Each plugin names its own
/// type for it so malformed messages are rejected at deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchMessage<C> {
    pub data: C,
    pub analysis_id: Uuid,
    #[serde(default)]
    pub organization_id: Option<Uuid>,
}

impl<C: DeserializeOwned> DispatchMessage<C> {
    pub fn from_bytes(body: &[u8]) -> Result<Self, MessagingError> {
        serde_json::from_slice(body)
            .map_err(|e| MessagingError::message_deserialization(e.to_string()))
    }
}

impl<C: Serialize> DispatchMessage<C> {
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(self).map_err(|e| MessagingError::message_serialization(e.to_string()))
    }
}

/// Notification that a plugin finished its step of an analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub analysis_id: Uuid,
    #[serde(rename = "sbom")]
    pub plugin: String,
}

impl CompletionMessage {
    pub fn new(analysis_id: Uuid, plugin: impl Into<String>) -> Self {
        Self {
            analysis_id,
            plugin: plugin.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(self).map_err(|e| MessagingError::message_serialization(e.to_string()))
    }

    pub fn from_bytes(body: &[u8]) -> Result<Self, MessagingError> {
        serde_json::from_slice(body)
            .map_err(|e| MessagingError::message_deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct SbomConfig {
        project: String,
    }

    #[test]
    fn test_dispatch_message_validated_at_boundary() {
        let id = Uuid::new_v4();
        let body = json!({
            "data": {"project": "/src/app"},
            "analysis_id": id,
            "organization_id": Uuid::nil(),
        })
        .to_string();

        let msg = DispatchMessage::<SbomConfig>::from_bytes(body.as_bytes()).unwrap();
        assert_eq!(msg.analysis_id, id);
        assert_eq!(msg.data.project, "/src/app");

        let missing = json!({"data": {}, "analysis_id": id}).to_string();
        let err = DispatchMessage::<SbomConfig>::from_bytes(missing.as_bytes()).unwrap_err();
        assert!(matches!(err, MessagingError::MessageDeserialization { .. }));
    }

    #[test]
    fn test_completion_message_wire_format() {
        let id = Uuid::new_v4();
        let bytes = CompletionMessage::new(id, "js-sbom").to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"analysis_id": id, "sbom": "js-sbom"}));
    }

    #[test]
    fn test_queue_names() {
        assert_eq!(dispatcher_queue_name("license-finder"), "dispatcher_license-finder");
        assert_eq!(PLUGINS_DISPATCHER_QUEUE, "plugins_dispatcher");
    }
}
