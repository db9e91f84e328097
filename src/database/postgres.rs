//! # PostgreSQL Repositories
//!
//! Job state records live in the `analysis` table of the results database,
//! result log rows in `result`, plugin registrations in the plugins database.
//!
//! `modify` takes a row lock (`SELECT ... FOR UPDATE`) before the write-back,
//! so two workers finishing sibling steps of one stage serialise on the record
//! instead of losing one update.

use std::time::Instant;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{JobMutation, JobStateStore, PluginStore, ResultStore};
use crate::errors::{StoreError, StoreResult};
use crate::models::{JobStateRecord, PluginDescriptor, ResultRecord, Step, StepStatus};

const SELECT_ANALYSIS: &str = r#"
    SELECT id, stage, steps, config, status, "organizationId", "projectId"
    FROM analysis
    WHERE id = $1
"#;

const SELECT_ANALYSIS_FOR_UPDATE: &str = r#"
    SELECT id, stage, steps, config, status, "organizationId", "projectId"
    FROM analysis
    WHERE id = $1
    FOR UPDATE
"#;

const UPDATE_ANALYSIS: &str = r#"
    UPDATE analysis
    SET stage = $2, steps = $3, config = $4, status = $5
    WHERE id = $1
"#;

#[derive(Debug, FromRow)]
struct AnalysisRow {
    id: Uuid,
    stage: i32,
    steps: Json<Vec<Vec<Step>>>,
    config: Json<serde_json::Value>,
    status: String,
    #[sqlx(rename = "organizationId")]
    organization_id: Option<Uuid>,
    #[sqlx(rename = "projectId")]
    project_id: Option<Uuid>,
}

impl AnalysisRow {
    fn into_record(self) -> StoreResult<JobStateRecord> {
        let record_id = self.id;
        let corrupt = |reason: String| StoreError::Corrupt { record_id, reason };
        let stage = usize::try_from(self.stage)
            .map_err(|_| corrupt(format!("negative stage {}", self.stage)))?;
        let status = match self.status.as_str() {
            "" => None,
            raw => Some(raw.parse::<StepStatus>().map_err(corrupt)?),
        };

        Ok(JobStateRecord {
            id: record_id,
            stage,
            steps: self.steps.0,
            config: self.config.0,
            status,
            organization_id: self.organization_id,
            project_id: self.project_id,
        })
    }
}

/// Job state records in the `analysis` table
#[derive(Debug, Clone)]
pub struct PgJobStateStore {
    pool: PgPool,
}

impl PgJobStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStateStore for PgJobStateStore {
    async fn load(&self, job_id: Uuid) -> StoreResult<JobStateRecord> {
        let row: Option<AnalysisRow> = sqlx::query_as(SELECT_ANALYSIS)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::database("load analysis", e))?;

        row.ok_or(StoreError::JobNotFound { job_id })?.into_record()
    }

    async fn modify(&self, job_id: Uuid, mutation: JobMutation) -> StoreResult<JobStateRecord> {
        let start = Instant::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::database("begin transaction", e))?;

        let row: Option<AnalysisRow> = sqlx::query_as(SELECT_ANALYSIS_FOR_UPDATE)
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::database("lock analysis", e))?;

        // Dropping `tx` on any early return rolls back
        let mut record = row.ok_or(StoreError::JobNotFound { job_id })?.into_record()?;

        if let Err(err) = mutation(&mut record) {
            if let Err(rollback) = tx.rollback().await {
                warn!(job_id = %job_id, error = %rollback, "Rollback failed");
            }
            return Err(err);
        }

        let stage = i32::try_from(record.stage).map_err(|_| StoreError::Corrupt {
            record_id: job_id,
            reason: format!("stage {} does not fit the stage column", record.stage),
        })?;
        let status = record.status.map(|s| s.as_str()).unwrap_or("");

        sqlx::query(UPDATE_ANALYSIS)
            .bind(job_id)
            .bind(stage)
            .bind(Json(&record.steps))
            .bind(Json(&record.config))
            .bind(status)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::database("update analysis", e))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::database("commit analysis", e))?;

        debug!(
            job_id = %job_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Job state record updated"
        );
        Ok(record)
    }
}

/// Append-only `result` table
#[derive(Debug, Clone)]
pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn insert_result(&self, record: &ResultRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO result (id, result, "analysisId", plugin, created_on)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.id)
        .bind(Json(&record.result))
        .bind(record.job_id)
        .bind(&record.plugin)
        .bind(record.created_on)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| StoreError::database("insert result", e))
    }
}

/// `plugin` registry table
#[derive(Debug, Clone)]
pub struct PgPluginStore {
    pool: PgPool,
}

impl PgPluginStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PluginStore for PgPluginStore {
    async fn register_if_absent(&self, descriptor: &PluginDescriptor) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO plugin (id, name, version, depends_on, description, config)
            SELECT $1, $2, $3, $4, $5, $6
            WHERE NOT EXISTS (SELECT 1 FROM plugin WHERE name = $2)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&descriptor.name)
        .bind(&descriptor.version)
        .bind(&descriptor.depends_on)
        .bind(&descriptor.description)
        .bind(Json(&descriptor.config))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("register plugin", e))?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn insert_analysis(pool: &PgPool, record: &JobStateRecord) {
        sqlx::query("INSERT INTO analysis (id, stage, steps, config, status) VALUES ($1, $2, $3, $4, '')")
            .bind(record.id)
            .bind(record.stage as i32)
            .bind(Json(&record.steps))
            .bind(Json(&record.config))
            .execute(pool)
            .await
            .unwrap();
    }

    fn sample_record() -> JobStateRecord {
        JobStateRecord::new(
            Uuid::new_v4(),
            vec![vec![
                Step::new("js-sbom", StepStatus::Ongoing),
                Step::new("php-sbom", StepStatus::Ongoing),
            ]],
        )
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires PostgreSQL (DATABASE_URL)"]
    async fn test_modify_persists_whole_record(pool: PgPool) {
        let store = PgJobStateStore::new(pool.clone());
        let record = sample_record();
        insert_analysis(&pool, &record).await;

        let updated = store
            .modify(
                record.id,
                Box::new(|r| {
                    r.steps[0][0].set_status(StepStatus::Success);
                    r.steps[0][0].set_result(json!({"packageCount": 42}));
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let reloaded = store.load(record.id).await.unwrap();
        assert_eq!(reloaded, updated);
        assert_eq!(reloaded.steps[0][0].result(), &json!({"packageCount": 42}));
        assert_eq!(reloaded.steps[0][1], record.steps[0][1]);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires PostgreSQL (DATABASE_URL)"]
    async fn test_failed_mutation_rolls_back(pool: PgPool) {
        let store = PgJobStateStore::new(pool.clone());
        let record = sample_record();
        insert_analysis(&pool, &record).await;

        let err = store
            .modify(
                record.id,
                Box::new(|r| {
                    r.steps[0][0].set_status(StepStatus::Failure);
                    Err(StoreError::step_not_found(r.id, "ghost", 0))
                }),
            )
            .await
            .unwrap_err();
        assert!(err.is_stage_mismatch());
        assert_eq!(store.load(record.id).await.unwrap(), record);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires PostgreSQL (DATABASE_URL)"]
    async fn test_result_and_plugin_registration(pool: PgPool) {
        let record = sample_record();
        insert_analysis(&pool, &record).await;

        let results = PgResultStore::new(pool.clone());
        results
            .insert_result(&ResultRecord::new(record.id, "js-sbom", json!({"ok": true})))
            .await
            .unwrap();

        let plugins = PgPluginStore::new(pool.clone());
        let descriptor = PluginDescriptor::new("js-sbom", "1.0.0");
        assert!(plugins.register_if_absent(&descriptor).await.unwrap());
        assert!(!plugins.register_if_absent(&descriptor).await.unwrap());
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires PostgreSQL (DATABASE_URL)"]
    async fn test_load_missing_job(pool: PgPool) {
        let store = PgJobStateStore::new(pool);
        let id = Uuid::new_v4();
        assert_eq!(
            store.load(id).await.unwrap_err(),
            StoreError::JobNotFound { job_id: id }
        );
    }
}
