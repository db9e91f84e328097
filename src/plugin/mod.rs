//! # Analysis Plugins
//!
//! The contract an analysis plugin implements, and [`PluginHandler`], the
//! queue callback that runs a plugin for each dispatch message and records the
//! outcome.

pub mod handler;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::messaging::{DispatchMessage, HandlerContext};
use crate::models::{JobStateRecord, StepStatus};
use crate::resilience::StructuredError;

pub use handler::PluginHandler;

/// What a plugin run produced
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutput<T> {
    pub result: T,
    /// Status written into the plugin's step
    pub status: StepStatus,
}

impl<T> AnalysisOutput<T> {
    pub fn new(result: T, status: StepStatus) -> Self {
        Self { result, status }
    }

    pub fn success(result: T) -> Self {
        Self::new(result, StepStatus::Success)
    }
}

/// An analysis plugin
///
/// `Config` is the plugin-specific `data` blob of the dispatch message. A
/// message whose blob does not deserialize is rejected before the plugin runs.
#[async_trait]
pub trait AnalysisPlugin: Send + Sync + 'static {
    type Config: DeserializeOwned + Send + Sync;
    type Output: Serialize + Send;

    /// Plugin name, also the step name it owns and the suffix of its queue
    fn name(&self) -> &str;

    /// Ecosystem tag attached to this plugin's errors
    fn ecosystem(&self) -> &str;

    async fn start_analysis(
        &self,
        ctx: &HandlerContext,
        message: &DispatchMessage<Self::Config>,
        job: &JobStateRecord,
    ) -> Result<AnalysisOutput<Self::Output>, StructuredError>;
}
