#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, RabbitMQ in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Plugin Runtime
//!
//! Worker runtime shared by the analysis plugins of a code-analysis platform.
//! A plugin supplies its analysis callback; the runtime does everything around
//! it: connecting to the stores and the broker, consuming its dispatch queue,
//! recording results into the shared job state, watching connectivity and
//! reconnecting after failures.
//!
//! ## Module Organization
//!
//! - [`config`] - environment-driven configuration, validated at startup
//! - [`database`] - store seams, PostgreSQL repositories, [`ConnectionManager`]
//! - [`messaging`] - broker abstraction (RabbitMQ, in-memory) and [`MessageConsumer`]
//! - [`state`] - [`StepStateUpdater`], per-step job state writes
//! - [`resilience`] - [`StructuredError`], [`ErrorClassifier`], [`RetryPolicy`]
//! - [`health`] - [`HealthMonitor`] for one connection generation
//! - [`lifecycle`] - [`ServiceLifecycle`] state machine and shutdown signal
//! - [`plugin`] - [`AnalysisPlugin`] contract and [`PluginHandler`]
//! - [`metrics`] - [`RuntimeMetrics`] registry
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use plugin_runtime::{
//!     config::RuntimeConfig, lifecycle::shutdown_signal, logging, ConnectionManager,
//!     LifecycleConfig, MessageConsumer, PluginDescriptor, PluginHandler, RuntimeMetrics,
//!     ServiceLifecycle,
//! };
//! # use plugin_runtime::{AnalysisPlugin, AnalysisOutput, DispatchMessage, HandlerContext};
//! # use plugin_runtime::models::JobStateRecord;
//! # use plugin_runtime::resilience::StructuredError;
//! # struct JsSbom;
//! # #[async_trait::async_trait]
//! # impl AnalysisPlugin for JsSbom {
//! #     type Config = serde_json::Value;
//! #     type Output = serde_json::Value;
//! #     fn name(&self) -> &str { "js-sbom" }
//! #     fn ecosystem(&self) -> &str { "javascript" }
//! #     async fn start_analysis(&self, _: &HandlerContext, _: &DispatchMessage<Self::Config>, _: &JobStateRecord)
//! #         -> Result<AnalysisOutput<Self::Output>, StructuredError> {
//! #         Ok(AnalysisOutput::success(serde_json::json!({})))
//! #     }
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! logging::init_tracing();
//! let config = RuntimeConfig::from_env()?;
//! let metrics = Arc::new(RuntimeMetrics::new());
//!
//! let handler = PluginHandler::new(JsSbom);
//! let mut consumer = MessageConsumer::new(config.amqp.prefetch_count, metrics.clone());
//! consumer.register_queue(handler.queue_name(), true, Arc::new(handler));
//!
//! ServiceLifecycle::new(
//!     ConnectionManager::new(config),
//!     consumer,
//!     metrics,
//!     LifecycleConfig::default(),
//! )
//! .with_plugin_descriptor(PluginDescriptor::from_file("config.json")?)
//! .run(shutdown_signal())
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod database;
pub mod errors;
pub mod health;
pub mod lifecycle;
pub mod logging;
pub mod messaging;
pub mod metrics;
pub mod models;
pub mod plugin;
pub mod resilience;
pub mod state;

pub use config::{ConfigurationError, RuntimeConfig, StoreRole};
pub use database::{ConnectionManager, Connections};
pub use errors::{RuntimeError, RuntimeResult, StoreError, StoreResult};
pub use health::{HealthConfig, HealthFailure, HealthMonitor};
pub use lifecycle::{Connector, LifecycleConfig, LifecycleState, ServiceLifecycle};
pub use messaging::{
    CompletionMessage, DispatchMessage, HandlerContext, HandlerError, MessageConsumer,
    MessagingError, QueueHandler,
};
pub use metrics::{MetricsSnapshot, RuntimeMetrics};
pub use models::{JobStateRecord, PluginDescriptor, ResultRecord, Step, StepStatus};
pub use plugin::{AnalysisOutput, AnalysisPlugin, PluginHandler};
pub use resilience::{ErrorCategory, ErrorClassifier, ErrorSeverity, RetryPolicy, StructuredError};
pub use state::StepStateUpdater;
