//! Append-only result log entries, one per plugin execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result of one plugin execution. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: Uuid,
    /// Owning job (analysis) id
    pub job_id: Uuid,
    pub plugin: String,
    pub result: serde_json::Value,
    pub created_on: DateTime<Utc>,
}

impl ResultRecord {
    pub fn new(job_id: Uuid, plugin: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            plugin: plugin.into(),
            result,
            created_on: Utc::now(),
        }
    }
}
