//! # Plugin Handler
//!
//! Queue callback for `dispatcher_<plugin>`. For every dispatch message it
//! loads the job, runs the plugin under the retry policy, appends a result
//! record, writes the plugin's step and tells the dispatcher it is done.
//!
//! A failed analysis is still a completed run: the failure is recorded in
//! both the result log and the step, and the completion message is sent.
//!
//! The retry policy covers the plugin's own work only. A store or broker that
//! cannot be reached ends the run with [`HandlerError::Unavailable`], which
//! puts the delivery back on the queue for the next connection generation.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{AnalysisOutput, AnalysisPlugin};
use crate::errors::StoreError;
use crate::messaging::{
    dispatcher_queue_name, CompletionMessage, DispatchMessage, HandlerContext, HandlerError,
    MessagingError, QueueHandler, PLUGINS_DISPATCHER_QUEUE,
};
use crate::models::{JobStateRecord, ResultRecord, StepStatus};
use crate::resilience::{ErrorClassifier, RetryPolicy, StructuredError};
use crate::state::StepStateUpdater;

pub struct PluginHandler<P: AnalysisPlugin> {
    plugin: Arc<P>,
    classifier: ErrorClassifier,
    retry: RetryPolicy,
}

impl<P: AnalysisPlugin> std::fmt::Debug for PluginHandler<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandler")
            .field("plugin", &self.plugin.name())
            .field("retry", &self.retry)
            .finish()
    }
}

impl<P: AnalysisPlugin> PluginHandler<P> {
    pub fn new(plugin: P) -> Self {
        Self::from_arc(Arc::new(plugin))
    }

    pub fn from_arc(plugin: Arc<P>) -> Self {
        let classifier = ErrorClassifier::new(plugin.name(), plugin.ecosystem());
        Self {
            plugin,
            classifier,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Queue this handler consumes
    pub fn queue_name(&self) -> String {
        dispatcher_queue_name(self.plugin.name())
    }

    pub fn plugin(&self) -> &Arc<P> {
        &self.plugin
    }

    /// Run `op` until it succeeds or the retry policy gives up
    async fn retrying<T, F, Fut>(&self, stage: &str, job_id: Uuid, mut op: F) -> Result<T, StructuredError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, StructuredError>> + Send,
        T: Send,
    {
        let mut attempt = 0u32;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => self.classifier.classify_for_job(err, stage, job_id),
            };
            if !self.retry.should_retry(&err, attempt) {
                return Err(err.with_metadata("attempts", json!(attempt + 1)));
            }

            let delay = self.retry.retry_delay(attempt);
            warn!(
                plugin = %self.plugin.name(),
                job_id = %job_id,
                stage = %stage,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after recoverable error"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Unreachable database: requeue. Anything else the store reports is
    /// about the job itself and is final.
    fn store_error(&self, err: StoreError, stage: &str, job_id: Uuid) -> HandlerError {
        let unreachable = matches!(err, StoreError::Database { .. });
        let err = self
            .classifier
            .classify_for_job(StructuredError::from(err), stage, job_id);
        if unreachable {
            HandlerError::Unavailable(err)
        } else {
            HandlerError::Failed(err)
        }
    }

    async fn load_job(
        &self,
        ctx: &HandlerContext,
        job_id: Uuid,
    ) -> Result<JobStateRecord, HandlerError> {
        let start = Instant::now();
        let outcome = ctx.connections.job_states().load(job_id).await;
        ctx.metrics
            .record_database_operation("load_job", outcome.is_ok(), start.elapsed());
        outcome.map_err(|e| self.store_error(e, "load_job", job_id))
    }

    async fn record_result(
        &self,
        ctx: &HandlerContext,
        job_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), HandlerError> {
        let start = Instant::now();
        let record = ResultRecord::new(job_id, self.plugin.name(), result);
        let outcome = ctx.connections.results().insert_result(&record).await;
        ctx.metrics
            .record_database_operation("insert_result", outcome.is_ok(), start.elapsed());
        outcome.map_err(|e| self.store_error(e, "insert_result", job_id))
    }

    async fn notify_dispatcher(&self, ctx: &HandlerContext, job_id: Uuid) -> Result<(), HandlerError> {
        let completion = CompletionMessage::new(job_id, self.plugin.name());
        let payload = completion.to_bytes().map_err(|e| {
            HandlerError::Failed(self.classifier.classify_for_job(StructuredError::from(e), "notify", job_id))
        })?;
        ctx.connections
            .broker()
            .publish(PLUGINS_DISPATCHER_QUEUE, &payload)
            .await
            .map_err(|e: MessagingError| {
                HandlerError::Unavailable(
                    self.classifier
                        .classify_for_job(StructuredError::from(e), "notify", job_id),
                )
            })
    }
}

#[async_trait]
impl<P: AnalysisPlugin> QueueHandler for PluginHandler<P> {
    #[instrument(skip_all, fields(plugin = %self.plugin.name(), queue = %ctx.queue))]
    async fn handle(&self, ctx: HandlerContext, body: Vec<u8>) -> Result<(), HandlerError> {
        let message = match DispatchMessage::<P::Config>::from_bytes(&body) {
            Ok(message) => message,
            Err(e) => {
                let err = self.classifier.classify(StructuredError::from(e), "parse_message");
                warn!(error = %err, "Rejecting malformed dispatch message");
                return Err(HandlerError::Failed(err));
            }
        };
        let job_id = message.analysis_id;
        let started_on = Utc::now();
        info!(job_id = %job_id, redelivered = ctx.redelivered, "Starting analysis");

        let job = self.load_job(&ctx, job_id).await?;

        let plugin = &self.plugin;
        let analysis = self
            .retrying("start_analysis", job_id, || {
                plugin.start_analysis(&ctx, &message, &job)
            })
            .await;

        // Step result, result log payload, step status
        let (step_result, logged, status, failure) = match analysis.and_then(|output| {
            serialize_output(output)
                .map_err(|e| self.classifier.classify_for_job(e, "serialize_output", job_id))
        }) {
            Ok((result, status)) => (result.clone(), result, status, None),
            Err(err) => {
                let logged = serde_json::to_value(&err)
                    .unwrap_or_else(|_| json!({ "message": err.message }));
                (json!({}), json!({ "error": logged }), StepStatus::Failure, Some(err))
            }
        };
        let ended_on = Utc::now();

        self.record_result(&ctx, job_id, logged).await?;

        let updater = StepStateUpdater::new(ctx.connections.job_states().clone())
            .with_metrics(ctx.metrics.clone());
        updater
            .update_step(job_id, self.plugin.name(), step_result, status, started_on, ended_on)
            .await
            .map_err(|e| self.store_error(e, "update_step", job_id))?;

        self.notify_dispatcher(&ctx, job_id).await?;
        debug!(
            job_id = %job_id,
            status = %status,
            duration_ms = (ended_on - started_on).num_milliseconds(),
            "Analysis recorded"
        );

        match failure {
            Some(err) => Err(HandlerError::Failed(err)),
            None => Ok(()),
        }
    }
}

fn serialize_output<T: serde::Serialize>(
    output: AnalysisOutput<T>,
) -> Result<(serde_json::Value, StepStatus), StructuredError> {
    let value = serde_json::to_value(&output.result).map_err(|e| {
        StructuredError::processing("plugin output is not serializable").with_cause(e)
    })?;
    Ok((value, output.status))
}
