//! # Connection Management
//!
//! [`ConnectionManager`] opens one pool per required store and the single
//! broker connection, in sequence, failing fast: if any store refuses the
//! connection or does not answer the initial probe in time, or the broker does
//! not accept the connection in time, everything opened so far is closed and
//! the error is returned. Retrying is the lifecycle's job.
//!
//! The sequencing lives in [`open_in_sequence`], which is generic over how a
//! store is opened and how the broker is reached.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{
    DataStore, JobStateStore, PgJobStateStore, PgPluginStore, PgResultStore, PgStore, PluginStore,
    ResultStore,
};
use crate::config::{RuntimeConfig, StoreRole};
use crate::errors::{RuntimeError, RuntimeResult};
use crate::lifecycle::Connector;
use crate::messaging::rabbitmq::RabbitMqConnection;
use crate::messaging::{BrokerConnection, MessagingError};

/// Timeout for the liveness probe run on every freshly opened store, and for
/// the broker connection handshake
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Stores and broker connection opened by [`open_in_sequence`]
#[derive(Debug)]
pub struct Opened<S, B> {
    pub stores: Vec<S>,
    pub broker: B,
}

/// Open every store in `roles` order, probing each, then connect the broker
///
/// The first failure closes whatever was already opened and is returned;
/// later stores and the broker are not attempted. Each store probe and the
/// broker connect are bounded by `probe_timeout`.
pub async fn open_in_sequence<S, B, OS, FS, CB, FB>(
    roles: &[StoreRole],
    probe_timeout: Duration,
    mut open_store: OS,
    connect_broker: CB,
) -> RuntimeResult<Opened<S, B>>
where
    S: DataStore,
    OS: FnMut(StoreRole) -> FS,
    FS: Future<Output = RuntimeResult<S>>,
    CB: FnOnce() -> FB,
    FB: Future<Output = Result<B, MessagingError>>,
{
    let mut stores: Vec<S> = Vec::with_capacity(roles.len());
    for role in roles {
        match open_probed(*role, probe_timeout, &mut open_store).await {
            Ok(store) => stores.push(store),
            Err(e) => {
                error!(store = %role, error = %e, "Failed to open store");
                close_all(&stores).await;
                return Err(e);
            }
        }
    }

    let broker = match tokio::time::timeout(probe_timeout, connect_broker()).await {
        Ok(Ok(broker)) => broker,
        Ok(Err(e)) => {
            error!(error = %e, "Failed to connect to broker");
            close_all(&stores).await;
            return Err(e.into());
        }
        Err(_) => {
            warn!(
                timeout_ms = probe_timeout.as_millis() as u64,
                "Broker connection timed out"
            );
            close_all(&stores).await;
            return Err(RuntimeError::timeout("connect broker", probe_timeout));
        }
    };

    Ok(Opened { stores, broker })
}

async fn open_probed<S, OS, FS>(
    role: StoreRole,
    probe_timeout: Duration,
    open_store: &mut OS,
) -> RuntimeResult<S>
where
    S: DataStore,
    OS: FnMut(StoreRole) -> FS,
    FS: Future<Output = RuntimeResult<S>>,
{
    let store = open_store(role).await?;
    match tokio::time::timeout(probe_timeout, store.ping()).await {
        Ok(Ok(())) => Ok(store),
        Ok(Err(e)) => {
            store.close().await;
            Err(RuntimeError::connection(format!("database_{role}"), e.to_string()))
        }
        Err(_) => {
            warn!(store = %role, "Initial liveness probe timed out");
            store.close().await;
            Err(RuntimeError::timeout(format!("ping {role}"), probe_timeout))
        }
    }
}

async fn close_all<S: DataStore>(stores: &[S]) {
    for store in stores {
        store.close().await;
    }
}

/// Everything one connection generation holds
pub struct Connections {
    stores: Vec<Arc<dyn DataStore>>,
    broker: Arc<dyn BrokerConnection>,
    job_states: Arc<dyn JobStateStore>,
    results: Arc<dyn ResultStore>,
    plugins: Arc<dyn PluginStore>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Connections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connections")
            .field(
                "stores",
                &self.stores.iter().map(|s| s.name().to_string()).collect::<Vec<_>>(),
            )
            .field("broker", &self.broker.provider_name())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Connections {
    pub fn new(
        broker: Arc<dyn BrokerConnection>,
        job_states: Arc<dyn JobStateStore>,
        results: Arc<dyn ResultStore>,
        plugins: Arc<dyn PluginStore>,
    ) -> Self {
        Self {
            stores: Vec::new(),
            broker,
            job_states,
            results,
            plugins,
            closed: AtomicBool::new(false),
        }
    }

    /// Add a store to be probed by the health monitor and closed on teardown
    pub fn with_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.stores.push(store);
        self
    }

    pub fn stores(&self) -> &[Arc<dyn DataStore>] {
        &self.stores
    }

    pub fn broker(&self) -> &Arc<dyn BrokerConnection> {
        &self.broker
    }

    pub fn job_states(&self) -> &Arc<dyn JobStateStore> {
        &self.job_states
    }

    pub fn results(&self) -> &Arc<dyn ResultStore> {
        &self.results
    }

    pub fn plugins(&self) -> &Arc<dyn PluginStore> {
        &self.plugins
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the broker connection and every store
    ///
    /// Idempotent. Individual failures are logged and do not stop the teardown.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.broker.close().await {
            error!(error = %e, "Error closing broker connection");
        }
        for store in &self.stores {
            store.close().await;
            info!(store = %store.name(), "Store connection closed");
        }
        info!("All connections closed");
    }
}

/// Opens the stores and broker connection described by a [`RuntimeConfig`]
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    config: RuntimeConfig,
    stores: Vec<StoreRole>,
    probe_timeout: Duration,
    connection_name: String,
}

impl ConnectionManager {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            stores: StoreRole::ALL.to_vec(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            connection_name: "plugin-runtime".to_string(),
        }
    }

    /// Restrict the stores opened. Results and plugins are always opened since
    /// the repositories live there.
    pub fn with_stores(mut self, roles: &[StoreRole]) -> Self {
        self.stores = StoreRole::ALL
            .into_iter()
            .filter(|role| {
                roles.contains(role) || matches!(role, StoreRole::Results | StoreRole::Plugins)
            })
            .collect();
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Name reported to the broker for this connection
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub async fn connect(&self) -> RuntimeResult<Connections> {
        self.config.validate()?;

        let redacted_url = self.config.redacted_amqp_url();
        let Opened { stores, broker } = open_in_sequence(
            &self.stores,
            self.probe_timeout,
            |role| self.open_store(role),
            || RabbitMqConnection::connect(&self.config.amqp.url, &redacted_url, &self.connection_name),
        )
        .await?;

        let pool_for = |role: StoreRole| {
            stores
                .iter()
                .find(|s| s.role() == role)
                .map(|s| s.pool().clone())
                .ok_or_else(|| RuntimeError::Internal(format!("store {role} was not opened")))
        };
        let pools = pool_for(StoreRole::Results).and_then(|results| {
            pool_for(StoreRole::Plugins).map(|plugins| (results, plugins))
        });
        let (results_pool, plugins_pool) = match pools {
            Ok(pools) => pools,
            Err(e) => {
                close_all(&stores).await;
                if let Err(close) = broker.close().await {
                    warn!(error = %close, "Error closing broker connection");
                }
                return Err(e);
            }
        };

        let mut connections = Connections::new(
            Arc::new(broker),
            Arc::new(PgJobStateStore::new(results_pool.clone())),
            Arc::new(PgResultStore::new(results_pool)),
            Arc::new(PgPluginStore::new(plugins_pool)),
        );
        for store in stores {
            connections = connections.with_store(Arc::new(store));
        }

        info!(
            stores = connections.stores().len(),
            broker = %redacted_url,
            "All connections established"
        );
        Ok(connections)
    }

    async fn open_store(&self, role: StoreRole) -> RuntimeResult<PgStore> {
        let pool_config = self.config.pool_config(role);
        let store = PgStore::connect(role, &self.config.database_url(role), &pool_config)
            .await
            .map_err(|e| RuntimeError::connection(format!("database_{role}"), e.to_string()))?;
        info!(
            store = %role,
            max_connections = pool_config.max_connections,
            min_connections = pool_config.min_connections,
            "Store pool opened"
        );
        Ok(store)
    }
}

#[async_trait]
impl Connector for ConnectionManager {
    async fn connect(&self) -> RuntimeResult<Arc<Connections>> {
        ConnectionManager::connect(self).await.map(Arc::new)
    }
}
