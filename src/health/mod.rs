//! # Health Monitoring
//!
//! Periodic liveness checks of one connection generation.

pub mod monitor;

pub use monitor::{HealthConfig, HealthFailure, HealthMonitor};
