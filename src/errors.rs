//! Error types for the plugin runtime.
//!

use thiserror::Error;
use uuid::Uuid;

pub use crate::config::ConfigurationError;
pub use crate::messaging::MessagingError;

/// Crate-level error returned by the connection, consumer and lifecycle layers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("Connection error for {component}: {message}")]
    Connection { component: String, message: String },
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn connection(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

impl From<sqlx::Error> for RuntimeError {
    fn from(err: sqlx::Error) -> Self {
        RuntimeError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Serialization(err.to_string())
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors raised by the persistence layer (job state, results, plugin registry).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Job {job_id} not found")]
    JobNotFound { job_id: Uuid },

    #[error("Step {plugin} not found in stage {stage} of job {job_id}")]
    StepNotFound {
        job_id: Uuid,
        plugin: String,
        stage: usize,
    },

    #[error("Stage {stage} out of range for job {job_id} ({stage_count} stages)")]
    StageOutOfRange {
        job_id: Uuid,
        stage: usize,
        stage_count: usize,
    },

    #[error("Step {plugin} of job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        plugin: String,
        from: String,
        to: String,
    },

    #[error("Database error during {operation}: {reason}")]
    Database { operation: String, reason: String },

    #[error("Corrupt record {record_id}: {reason}")]
    Corrupt { record_id: Uuid, reason: String },
}

impl StoreError {
    pub fn step_not_found(job_id: Uuid, plugin: impl Into<String>, stage: usize) -> Self {
        Self::StepNotFound {
            job_id,
            plugin: plugin.into(),
            stage,
        }
    }

    pub fn database(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Database {
            operation: operation.into(),
            reason: err.to_string(),
        }
    }

    /// Mismatch errors indicate a plugin running against a job on another stage.
    pub fn is_stage_mismatch(&self) -> bool {
        matches!(self, Self::StepNotFound { .. } | Self::StageOutOfRange { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
