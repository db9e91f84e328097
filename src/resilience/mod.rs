//! # Resilience Module
//!
//! Classification of faults raised while handling a delivery and the bounded
//! retry policy applied to them.
//!
//! - **Error classification**: [`ErrorClassifier`] turns any fault into a tagged
//!   [`StructuredError`] (category, severity, recoverable flag, context)
//! - **Retry policy**: [`RetryPolicy`] decides whether and when to retry
//!
//! ## Usage
//!
//! ```rust
//! use plugin_runtime::resilience::{ErrorClassifier, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default();
//! let classifier = ErrorClassifier::new("vuln-finder", "javascript");
//!
//! let err = classifier.classify("advisory feed timed out", "fetch_advisories");
//! assert!(policy.should_retry(&err, 0));
//! assert_eq!(policy.retry_delay(2), Duration::from_secs(4));
//! ```

pub mod error_classifier;
pub mod retry;

pub use error_classifier::{
    ErrorCategory, ErrorClassifier, ErrorSeverity, StructuredError, StructuredErrorBuilder,
};
pub use retry::RetryPolicy;
