//! # Step State Updater
//!
//! Writes one plugin's status and result into the step it owns in the job's
//! current stage. Each call is one transaction: reload the record, patch the
//! step in place, write the whole record back. A plugin with no step in the
//! current stage gets a "step not found" error and nothing is written.
//!
//! Updates are idempotent: redelivering the same work writes the same final
//! fields, and a terminal step never moves back to a non-terminal status.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::database::JobStateStore;
use crate::errors::{StoreError, StoreResult};
use crate::metrics::RuntimeMetrics;
use crate::models::{JobStateRecord, StepStatus};

/// Fields written into a plugin's step
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    pub plugin: String,
    pub status: StepStatus,
    pub result: serde_json::Value,
    pub started_on: DateTime<Utc>,
    pub ended_on: DateTime<Utc>,
}

/// Patch the step named `update.plugin` in the record's current stage
///
/// Only that step's status, result and timestamps change. Every other step,
/// and every other key of the patched step, is carried over as stored.
pub fn apply_step_update(record: &mut JobStateRecord, update: &StepUpdate) -> StoreResult<()> {
    let job_id = record.id;
    let stage = record.stage;
    let stage_count = record.stage_count();

    let steps = record
        .current_stage_mut()
        .ok_or(StoreError::StageOutOfRange {
            job_id,
            stage,
            stage_count,
        })?;

    let step = steps
        .iter_mut()
        .find(|step| step.name() == update.plugin)
        .ok_or_else(|| StoreError::step_not_found(job_id, &update.plugin, stage))?;

    if let Some(current) = step.status() {
        if !current.can_transition_to(update.status) {
            return Err(StoreError::InvalidTransition {
                job_id,
                plugin: update.plugin.clone(),
                from: current.to_string(),
                to: update.status.to_string(),
            });
        }
    }

    step.set_status(update.status);
    step.set_result(update.result.clone());
    step.set_started_on(update.started_on);
    step.set_ended_on(update.ended_on);
    Ok(())
}

/// Applies step updates through a [`JobStateStore`]
#[derive(Clone)]
pub struct StepStateUpdater {
    store: Arc<dyn JobStateStore>,
    metrics: Option<Arc<RuntimeMetrics>>,
}

impl std::fmt::Debug for StepStateUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepStateUpdater")
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl StepStateUpdater {
    pub fn new(store: Arc<dyn JobStateStore>) -> Self {
        Self {
            store,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RuntimeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Write `plugin`'s outcome into job `job_id` and return the persisted record
    pub async fn update_step(
        &self,
        job_id: Uuid,
        plugin: &str,
        result: serde_json::Value,
        status: StepStatus,
        started_on: DateTime<Utc>,
        ended_on: DateTime<Utc>,
    ) -> StoreResult<JobStateRecord> {
        let update = StepUpdate {
            plugin: plugin.to_string(),
            status,
            result,
            started_on,
            ended_on,
        };

        let start = Instant::now();
        let outcome = self
            .store
            .modify(
                job_id,
                Box::new(move |record| apply_step_update(record, &update)),
            )
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.record_database_operation("update_step", outcome.is_ok(), start.elapsed());
        }

        match &outcome {
            Ok(record) => debug!(
                job_id = %job_id,
                plugin = %plugin,
                status = %status,
                stage = record.stage,
                "Step updated"
            ),
            Err(e) if e.is_stage_mismatch() => warn!(
                job_id = %job_id,
                plugin = %plugin,
                error = %e,
                "Plugin does not own a step in the job's current stage"
            ),
            Err(e) => error!(job_id = %job_id, plugin = %plugin, error = %e, "Step update failed"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::in_memory::InMemoryJobStateStore;
    use crate::models::Step;
    use chrono::TimeZone;
    use serde_json::json;

    fn job_with_stage0(steps: Vec<Step>) -> JobStateRecord {
        JobStateRecord::new(
            Uuid::new_v4(),
            vec![steps, vec![Step::new("vuln-finder", StepStatus::Started)]],
        )
    }

    fn updater_for(record: &JobStateRecord) -> (StepStateUpdater, Arc<InMemoryJobStateStore>) {
        let store = Arc::new(InMemoryJobStateStore::new());
        store.insert(record.clone());
        (StepStateUpdater::new(store.clone()), store)
    }

    fn times() -> (DateTime<Utc>, DateTime<Utc>) {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 7).unwrap();
        (t0, t1)
    }

    #[tokio::test]
    async fn test_js_sbom_success() {
        let record = job_with_stage0(vec![Step::new("js-sbom", StepStatus::Ongoing)]);
        let (updater, store) = updater_for(&record);
        let (t0, t1) = times();

        let updated = updater
            .update_step(record.id, "js-sbom", json!({"packageCount": 42}), StepStatus::Success, t0, t1)
            .await
            .unwrap();

        let step = &updated.steps[0][0];
        assert_eq!(step.status(), Some(StepStatus::Success));
        assert_eq!(step.result(), &json!({"packageCount": 42}));
        assert_eq!(step.started_on(), Some(t0));
        assert_eq!(step.ended_on(), Some(t1));
        assert_eq!(step.get("Started_on"), Some(&json!("2024-05-01T10:00:00Z")));
        assert_eq!(store.get(record.id), Some(updated));
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_siblings_unchanged() {
        // Written by another worker, in formats this runtime does not produce
        let raw = r#"{"Config":{"depth":2},"Ended_on":"2024-05-01T12:00:07+02:00","Name":"php-sbom","Result":{"ratio":0.25},"Retries":1,"Started_on":"2024-05-01 10:00:00.000","Status":"ongoing","Version":"0.9.1"}"#;
        let sibling: Step = serde_json::from_str(raw).unwrap();
        let record = job_with_stage0(vec![Step::new("js-sbom", StepStatus::Ongoing), sibling]);
        let before = serde_json::to_vec(&record.steps[0][1]).unwrap();
        let next_stage_before = serde_json::to_vec(&record.steps[1]).unwrap();

        let (updater, _) = updater_for(&record);
        let (t0, t1) = times();
        let updated = updater
            .update_step(record.id, "js-sbom", json!({}), StepStatus::Failure, t0, t1)
            .await
            .unwrap();

        assert_eq!(serde_json::to_vec(&updated.steps[0][1]).unwrap(), before);
        assert_eq!(serde_json::to_string(&updated.steps[0][1]).unwrap(), raw);
        assert_eq!(updated.steps[0][1].get("Started_on"), Some(&json!("2024-05-01 10:00:00.000")));
        assert_eq!(serde_json::to_vec(&updated.steps[1]).unwrap(), next_stage_before);
        assert_eq!(updated.config, record.config);
    }

    #[tokio::test]
    async fn test_step_not_in_current_stage() {
        let record = job_with_stage0(vec![Step::new("js-sbom", StepStatus::Ongoing)]);
        let (updater, store) = updater_for(&record);
        let (t0, t1) = times();

        // vuln-finder exists, but in stage 1
        let err = updater
            .update_step(record.id, "vuln-finder", json!({}), StepStatus::Success, t0, t1)
            .await
            .unwrap_err();

        assert_eq!(err, StoreError::step_not_found(record.id, "vuln-finder", 0));
        assert_eq!(store.get(record.id), Some(record));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_stage_out_of_range() {
        let mut record = job_with_stage0(vec![Step::new("js-sbom", StepStatus::Ongoing)]);
        record.stage = 2;
        let (updater, _) = updater_for(&record);
        let (t0, t1) = times();

        let err = updater
            .update_step(record.id, "js-sbom", json!({}), StepStatus::Success, t0, t1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StageOutOfRange { stage: 2, stage_count: 2, .. }));
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent_and_terminal_is_sticky() {
        let record = job_with_stage0(vec![Step::new("js-sbom", StepStatus::Ongoing)]);
        let (updater, store) = updater_for(&record);
        let (t0, t1) = times();
        let result = json!({"packageCount": 42});

        let first = updater
            .update_step(record.id, "js-sbom", result.clone(), StepStatus::Success, t0, t1)
            .await
            .unwrap();
        let second = updater
            .update_step(record.id, "js-sbom", result, StepStatus::Success, t0, t1)
            .await
            .unwrap();
        assert_eq!(first, second);

        let err = updater
            .update_step(record.id, "js-sbom", json!({}), StepStatus::Ongoing, t0, t1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(store.get(record.id), Some(second));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let store = Arc::new(InMemoryJobStateStore::new());
        let metrics = Arc::new(RuntimeMetrics::new());
        let updater = StepStateUpdater::new(store).with_metrics(metrics.clone());
        let (t0, t1) = times();
        let id = Uuid::new_v4();

        let err = updater
            .update_step(id, "js-sbom", json!({}), StepStatus::Success, t0, t1)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::JobNotFound { job_id: id });
        assert_eq!(metrics.snapshot().database_operations["update_step"].error, 1);
    }
}
