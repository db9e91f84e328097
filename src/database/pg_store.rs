//! PostgreSQL pool for one logical store.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::{DataStore, PoolStats};
use crate::config::{PoolConfig, StoreRole};
use crate::errors::{StoreError, StoreResult};

/// Pooled connection to one of the worker's databases
#[derive(Clone)]
pub struct PgStore {
    role: StoreRole,
    pool: PgPool,
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore")
            .field("role", &self.role)
            .field("pool_size", &self.pool.size())
            .field("idle", &self.pool.num_idle())
            .field("closed", &self.pool.is_closed())
            .finish()
    }
}

impl PgStore {
    /// Open a pool sized by `pool_config`
    pub async fn connect(
        role: StoreRole,
        database_url: &str,
        pool_config: &PoolConfig,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_config.max_connections)
            .min_connections(pool_config.min_connections)
            .acquire_timeout(pool_config.acquire_timeout)
            .idle_timeout(Some(pool_config.idle_timeout))
            .max_lifetime(Some(pool_config.max_lifetime))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::database(format!("connect {role}"), e))?;

        Ok(Self { role, pool })
    }

    pub fn role(&self) -> StoreRole {
        self.role
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DataStore for PgStore {
    fn name(&self) -> &str {
        self.role.as_str()
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::database(format!("ping {}", self.role), e))
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        Some(PoolStats {
            size: self.pool.size(),
            idle: u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX),
        })
    }
}
