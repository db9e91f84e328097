//! # In-Memory Stores
//!
//! Store implementations for tests and local development. Record mutation
//! holds the record's lock for the whole read-modify-write, mirroring the row
//! lock taken by the PostgreSQL store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{DataStore, JobMutation, JobStateStore, PluginStore, PoolStats, ResultStore};
use crate::errors::{StoreError, StoreResult};
use crate::models::{JobStateRecord, PluginDescriptor, ResultRecord};

/// Job state records keyed by id
#[derive(Debug, Default)]
pub struct InMemoryJobStateStore {
    records: Mutex<HashMap<Uuid, JobStateRecord>>,
    writes: Mutex<u64>,
}

impl InMemoryJobStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: JobStateRecord) {
        self.records.lock().insert(record.id, record);
    }

    pub fn get(&self, job_id: Uuid) -> Option<JobStateRecord> {
        self.records.lock().get(&job_id).cloned()
    }

    /// Number of committed write-backs
    pub fn write_count(&self) -> u64 {
        *self.writes.lock()
    }
}

#[async_trait]
impl JobStateStore for InMemoryJobStateStore {
    async fn load(&self, job_id: Uuid) -> StoreResult<JobStateRecord> {
        self.get(job_id).ok_or(StoreError::JobNotFound { job_id })
    }

    async fn modify(&self, job_id: Uuid, mutation: JobMutation) -> StoreResult<JobStateRecord> {
        let mut records = self.records.lock();
        let stored = records
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound { job_id })?;

        // Work on a copy so a failed mutation leaves the stored record as it was
        let mut working = stored.clone();
        mutation(&mut working)?;
        *stored = working.clone();
        *self.writes.lock() += 1;
        Ok(working)
    }
}

/// Append-only result log
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    records: Mutex<Vec<ResultRecord>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ResultRecord> {
        self.records.lock().clone()
    }

    pub fn for_job(&self, job_id: Uuid) -> Vec<ResultRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn insert_result(&self, record: &ResultRecord) -> StoreResult<()> {
        let mut records = self.records.lock();
        if records.iter().any(|r| r.id == record.id) {
            return Err(StoreError::database(
                "insert result",
                format!("duplicate result id {}", record.id),
            ));
        }
        records.push(record.clone());
        Ok(())
    }
}

/// Plugin registry keyed by plugin name
#[derive(Debug, Default)]
pub struct InMemoryPluginStore {
    plugins: Mutex<HashMap<String, PluginDescriptor>>,
    unavailable: AtomicBool,
}

impl InMemoryPluginStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<PluginDescriptor> {
        self.plugins.lock().get(name).cloned()
    }

    /// Make registration fail, as an unreachable plugins database would
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl PluginStore for InMemoryPluginStore {
    async fn register_if_absent(&self, descriptor: &PluginDescriptor) -> StoreResult<bool> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::database("register plugin", "store unavailable"));
        }
        let mut plugins = self.plugins.lock();
        if plugins.contains_key(&descriptor.name) {
            return Ok(false);
        }
        plugins.insert(descriptor.name.clone(), descriptor.clone());
        Ok(true)
    }
}

/// Behaviour of an [`InMemoryDataStore`] liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PingBehavior {
    Healthy = 0,
    Failing = 1,
    /// Never answers
    Hanging = 2,
}

/// Store whose liveness can be scripted
#[derive(Debug)]
pub struct InMemoryDataStore {
    name: String,
    behavior: AtomicU8,
    closed: AtomicBool,
    pool: Mutex<Option<PoolStats>>,
}

impl InMemoryDataStore {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            behavior: AtomicU8::new(PingBehavior::Healthy as u8),
            closed: AtomicBool::new(false),
            pool: Mutex::new(None),
        })
    }

    pub fn set_behavior(&self, behavior: PingBehavior) {
        self.behavior.store(behavior as u8, Ordering::SeqCst);
    }

    pub fn behavior(&self) -> PingBehavior {
        match self.behavior.load(Ordering::SeqCst) {
            0 => PingBehavior::Healthy,
            1 => PingBehavior::Failing,
            _ => PingBehavior::Hanging,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pool occupancy to report, as a pooled store would
    pub fn set_pool_stats(&self, stats: PoolStats) {
        *self.pool.lock() = Some(stats);
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::database(format!("ping {}", self.name), "pool closed"));
        }
        match self.behavior() {
            PingBehavior::Healthy => Ok(()),
            PingBehavior::Failing => Err(StoreError::database(
                format!("ping {}", self.name),
                "connection refused",
            )),
            PingBehavior::Hanging => {
                // Long enough to outlast any probe timeout
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                Ok(())
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        *self.pool.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Step, StepStatus};

    #[tokio::test]
    async fn test_failed_mutation_leaves_record_untouched() {
        let store = InMemoryJobStateStore::new();
        let record = JobStateRecord::new(
            Uuid::new_v4(),
            vec![vec![Step::new("js-sbom", StepStatus::Ongoing)]],
        );
        store.insert(record.clone());

        let err = store
            .modify(
                record.id,
                Box::new(|r| {
                    r.steps[0][0].set_status(StepStatus::Success);
                    Err(StoreError::step_not_found(r.id, "other", 0))
                }),
            )
            .await
            .unwrap_err();

        assert!(err.is_stage_mismatch());
        assert_eq!(store.get(record.id), Some(record));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_plugin_registration_is_idempotent() {
        let store = InMemoryPluginStore::new();
        let descriptor = PluginDescriptor::new("js-sbom", "1.0.0");
        assert!(store.register_if_absent(&descriptor).await.unwrap());
        assert!(!store
            .register_if_absent(&PluginDescriptor::new("js-sbom", "2.0.0"))
            .await
            .unwrap());
        assert_eq!(store.get("js-sbom").unwrap().version, "1.0.0");
    }

    #[tokio::test]
    async fn test_data_store_behaviors() {
        let store = InMemoryDataStore::new("results");
        assert!(store.ping().await.is_ok());
        store.set_behavior(PingBehavior::Failing);
        assert!(store.ping().await.is_err());
        store.set_behavior(PingBehavior::Healthy);
        store.close().await;
        assert!(store.ping().await.is_err());
    }
}
