//! Configuration Error Types
//!
//! Configuration problems abort startup: the process has to be redeployed with
//! corrected settings, so none of these are retried.

use thiserror::Error;

/// Configuration-related errors with enough context to fix the deployment
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// One or more required environment variables are unset or empty
    #[error("Missing required environment variables: {}", variables.join(", "))]
    MissingRequired { variables: Vec<String> },

    /// A variable is set but cannot be interpreted
    #[error("Invalid value '{value}' for {variable}: {reason}")]
    InvalidValue {
        variable: String,
        value: String,
        reason: String,
    },

    /// Plugin descriptor (config.json) could not be read or parsed
    #[error("Failed to load plugin descriptor '{path}': {reason}")]
    Descriptor { path: String, reason: String },

    /// Cross-field validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

impl ConfigurationError {
    pub fn invalid_value(
        variable: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            variable: variable.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}
