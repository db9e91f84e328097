//! # Structured Error Classification
//!
//! Faults raised while a plugin handles a delivery are converted into a
//! [`StructuredError`]: a classified, context-carrying value that drives retry
//! decisions and ends up serialised into the failure result record.
//!
//! ## Usage
//!
//! ```rust
//! use plugin_runtime::resilience::{ErrorCategory, ErrorClassifier, ErrorSeverity, StructuredError};
//!
//! let classifier = ErrorClassifier::new("js-sbom", "javascript");
//!
//! // Raw faults become recoverable processing errors tagged with the context
//! let err = classifier.classify("lockfile parse failed", "parse_lockfile");
//! assert_eq!(err.category, ErrorCategory::Processing);
//! assert_eq!(err.severity, ErrorSeverity::Medium);
//! assert_eq!(err.plugin.as_deref(), Some("js-sbom"));
//!
//! // Tags already present are kept
//! let err = StructuredError::validation("missing package.json").with_stage("discover");
//! let err = classifier.classify(err, "parse_lockfile");
//! assert_eq!(err.stage.as_deref(), Some("discover"));
//! ```

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{RuntimeError, StoreError};
use crate::messaging::MessagingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Database,
    Network,
    Validation,
    Processing,
    Configuration,
    External,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Database => "database",
            Self::Network => "network",
            Self::Validation => "validation",
            Self::Processing => "processing",
            Self::Configuration => "configuration",
            Self::External => "external",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Classified error with context tags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredError {
    pub message: String,
    /// Rendered underlying cause
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecosystem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl StructuredError {
    /// Unclassified error: medium severity, unknown category, not recoverable
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            timestamp: Utc::now(),
            ecosystem: None,
            plugin: None,
            stage: None,
            job_id: None,
            severity: ErrorSeverity::Medium,
            category: ErrorCategory::Unknown,
            recoverable: false,
            metadata: HashMap::new(),
        }
    }

    pub fn builder(message: impl Into<String>) -> StructuredErrorBuilder {
        StructuredErrorBuilder {
            error: Self::new(message),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::classified(message, ErrorCategory::Database, ErrorSeverity::High, true)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::classified(message, ErrorCategory::Validation, ErrorSeverity::Medium, false)
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::classified(message, ErrorCategory::Processing, ErrorSeverity::Medium, true)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::classified(message, ErrorCategory::Configuration, ErrorSeverity::High, false)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::classified(message, ErrorCategory::Network, ErrorSeverity::Medium, true)
    }

    pub fn external(message: impl Into<String>) -> Self {
        Self::classified(message, ErrorCategory::External, ErrorSeverity::Medium, true)
    }

    fn classified(
        message: impl Into<String>,
        category: ErrorCategory,
        severity: ErrorSeverity,
        recoverable: bool,
    ) -> Self {
        Self {
            category,
            severity,
            recoverable,
            ..Self::new(message)
        }
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    pub fn with_ecosystem(mut self, ecosystem: impl Into<String>) -> Self {
        self.ecosystem = Some(ecosystem.into());
        self
    }

    pub fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn is_critical(&self) -> bool {
        self.severity == ErrorSeverity::Critical
    }

    /// Fill empty context tags, leaving those already set untouched
    pub fn fill_context(
        mut self,
        ecosystem: Option<&str>,
        plugin: Option<&str>,
        stage: Option<&str>,
        job_id: Option<Uuid>,
    ) -> Self {
        fn fill(slot: &mut Option<String>, value: Option<&str>) {
            if slot.is_none() {
                *slot = value.filter(|v| !v.is_empty()).map(str::to_string);
            }
        }
        fill(&mut self.ecosystem, ecosystem);
        fill(&mut self.plugin, plugin);
        fill(&mut self.stage, stage);
        if self.job_id.is_none() {
            self.job_id = job_id;
        }
        self
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.category, self.severity)?;
        if let Some(plugin) = &self.plugin {
            write!(f, " {plugin}")?;
        }
        if let Some(stage) = &self.stage {
            write!(f, " ({stage})")?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for StructuredError {}

/// Fluent construction of a [`StructuredError`]
#[derive(Debug, Clone)]
pub struct StructuredErrorBuilder {
    error: StructuredError,
}

impl StructuredErrorBuilder {
    pub fn category(mut self, category: ErrorCategory) -> Self {
        self.error.category = category;
        self
    }

    pub fn severity(mut self, severity: ErrorSeverity) -> Self {
        self.error.severity = severity;
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.error.recoverable = recoverable;
        self
    }

    pub fn cause(mut self, cause: impl fmt::Display) -> Self {
        self.error.cause = Some(cause.to_string());
        self
    }

    pub fn ecosystem(mut self, ecosystem: impl Into<String>) -> Self {
        self.error.ecosystem = Some(ecosystem.into());
        self
    }

    pub fn plugin(mut self, plugin: impl Into<String>) -> Self {
        self.error.plugin = Some(plugin.into());
        self
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.error.stage = Some(stage.into());
        self
    }

    pub fn job_id(mut self, job_id: Uuid) -> Self {
        self.error.job_id = Some(job_id);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.error.metadata.insert(key.into(), value);
        self
    }

    pub fn build(self) -> StructuredError {
        self.error
    }
}

impl From<StoreError> for StructuredError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::Database { .. } => Self::database(message),
            StoreError::Corrupt { .. } => Self {
                recoverable: false,
                ..Self::database(message)
            },
            StoreError::JobNotFound { .. }
            | StoreError::StepNotFound { .. }
            | StoreError::StageOutOfRange { .. }
            | StoreError::InvalidTransition { .. } => Self::validation(message),
        }
    }
}

impl From<MessagingError> for StructuredError {
    fn from(err: MessagingError) -> Self {
        let message = err.to_string();
        match err {
            MessagingError::MessageDeserialization { .. } => Self::validation(message),
            MessagingError::MessageSerialization { .. } => Self::processing(message),
            MessagingError::Configuration { .. } => Self::configuration(message),
            _ => Self::network(message),
        }
    }
}

impl From<RuntimeError> for StructuredError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Store(e) => e.into(),
            RuntimeError::Messaging(e) => e.into(),
            RuntimeError::Configuration(e) => Self::configuration(e.to_string()),
            RuntimeError::Database(_) => Self::database(err.to_string()),
            RuntimeError::Connection { .. } | RuntimeError::Timeout { .. } => {
                Self::network(err.to_string())
            }
            RuntimeError::Serialization(_) => Self::validation(err.to_string()),
            RuntimeError::Internal(_) => Self::processing(err.to_string()),
        }
    }
}

/// Plugin identity used to tag classified errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorClassifier {
    plugin: String,
    ecosystem: String,
}

impl ErrorClassifier {
    pub fn new(plugin: impl Into<String>, ecosystem: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            ecosystem: ecosystem.into(),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn ecosystem(&self) -> &str {
        &self.ecosystem
    }

    /// Classify a fault raised during `stage`
    ///
    /// A [`StructuredError`] only gets its missing tags filled. Anything else is
    /// wrapped as a recoverable, medium severity processing error.
    pub fn classify(
        &self,
        err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
        stage: &str,
    ) -> StructuredError {
        let err = err.into();
        let structured = match err.downcast::<StructuredError>() {
            Ok(existing) => *existing,
            Err(raw) => {
                let mut wrapped = StructuredError::processing(raw.to_string());
                wrapped.cause = raw.source().map(|s| s.to_string());
                wrapped
            }
        };
        structured.fill_context(
            Some(&self.ecosystem),
            Some(&self.plugin),
            Some(stage),
            None,
        )
    }

    /// [`classify`](Self::classify), also tagging the job being processed
    pub fn classify_for_job(
        &self,
        err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
        stage: &str,
        job_id: Uuid,
    ) -> StructuredError {
        self.classify(err, stage)
            .fill_context(None, None, None, Some(job_id))
    }
}
