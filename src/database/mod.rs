//! # Persistence Layer
//!
//! Store seams used by the runtime plus their PostgreSQL and in-memory
//! implementations.
//!
//! ## Key Components
//!
//! - [`DataStore`] - one pooled store connection, pinged by the health monitor
//! - [`JobStateStore`] - transactional read-modify-write of job state records
//! - [`ResultStore`] - append-only result log
//! - [`PluginStore`] - plugin registry
//! - [`ConnectionManager`] - opens every store and the broker connection
//!
//! Store errors surface as [`StoreError`](crate::errors::StoreError).

pub mod in_memory;
pub mod manager;
pub mod pg_store;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::StoreResult;
use crate::models::{JobStateRecord, PluginDescriptor, ResultRecord};

pub use manager::{open_in_sequence, ConnectionManager, Connections, Opened};
pub use pg_store::PgStore;
pub use postgres::{PgJobStateStore, PgPluginStore, PgResultStore};

/// Mutation applied to a job state record inside one transaction
///
/// Returning `Err` rolls the transaction back and leaves the record untouched.
pub type JobMutation = Box<dyn FnOnce(&mut JobStateRecord) -> StoreResult<()> + Send>;

/// Connection counts of a store's pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections, idle or checked out
    pub size: u32,
    pub idle: u32,
}

/// A pooled connection to one logical store
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Liveness probe
    async fn ping(&self) -> StoreResult<()>;

    /// Release pooled connections. Later calls are no-ops.
    async fn close(&self);

    /// Current pool occupancy, for stores backed by a pool
    fn pool_stats(&self) -> Option<PoolStats> {
        None
    }
}

#[async_trait]
impl<S: DataStore + ?Sized> DataStore for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn ping(&self) -> StoreResult<()> {
        (**self).ping().await
    }

    async fn close(&self) {
        (**self).close().await
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        (**self).pool_stats()
    }
}

#[async_trait]
pub trait JobStateStore: Send + Sync + 'static {
    async fn load(&self, job_id: Uuid) -> StoreResult<JobStateRecord>;

    /// Reload the record, apply `mutation` and write the whole record back,
    /// all in one transaction
    async fn modify(&self, job_id: Uuid, mutation: JobMutation) -> StoreResult<JobStateRecord>;
}

#[async_trait]
pub trait ResultStore: Send + Sync + 'static {
    async fn insert_result(&self, record: &ResultRecord) -> StoreResult<()>;
}

#[async_trait]
pub trait PluginStore: Send + Sync + 'static {
    /// Register `descriptor` unless a plugin with the same name exists.
    /// Returns whether a row was inserted.
    async fn register_if_absent(&self, descriptor: &PluginDescriptor) -> StoreResult<bool>;
}
