//! Connection factories used by the lifecycle to open each generation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::database::in_memory::{
    InMemoryDataStore, InMemoryJobStateStore, InMemoryPluginStore, InMemoryResultStore,
};
use crate::database::Connections;
use crate::errors::RuntimeResult;
use crate::messaging::in_memory::InMemoryBroker;

/// Opens a complete connection generation, or fails without leaving anything
/// open
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> RuntimeResult<Arc<Connections>>;
}

#[async_trait]
impl<C: Connector + ?Sized> Connector for Arc<C> {
    async fn connect(&self) -> RuntimeResult<Arc<Connections>> {
        (**self).connect().await
    }
}

/// [`Connector`] over an [`InMemoryBroker`] and in-memory stores
///
/// Store contents outlive generations, as a real database would. Each
/// generation gets fresh pool stand-ins, reachable through
/// [`current_stores`](Self::current_stores) so their liveness can be scripted.
#[derive(Debug)]
pub struct InMemoryConnector {
    broker: Arc<InMemoryBroker>,
    job_states: Arc<InMemoryJobStateStore>,
    results: Arc<InMemoryResultStore>,
    plugins: Arc<InMemoryPluginStore>,
    store_names: Vec<String>,
    current: Mutex<Vec<Arc<InMemoryDataStore>>>,
    connects: AtomicU32,
}

impl InMemoryConnector {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self {
            broker,
            job_states: Arc::new(InMemoryJobStateStore::new()),
            results: Arc::new(InMemoryResultStore::new()),
            plugins: Arc::new(InMemoryPluginStore::new()),
            store_names: vec!["results".to_string(), "plugins".to_string()],
            current: Mutex::new(Vec::new()),
            connects: AtomicU32::new(0),
        }
    }

    pub fn with_store_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.store_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }

    pub fn job_states(&self) -> &Arc<InMemoryJobStateStore> {
        &self.job_states
    }

    pub fn results(&self) -> &Arc<InMemoryResultStore> {
        &self.results
    }

    pub fn plugins(&self) -> &Arc<InMemoryPluginStore> {
        &self.plugins
    }

    /// Stores of the most recent generation
    pub fn current_stores(&self) -> Vec<Arc<InMemoryDataStore>> {
        self.current.lock().clone()
    }

    /// Number of generations opened so far
    pub fn successful_connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self) -> RuntimeResult<Arc<Connections>> {
        let broker = self.broker.connect()?;

        let stores: Vec<Arc<InMemoryDataStore>> = self
            .store_names
            .iter()
            .map(|name| InMemoryDataStore::new(name.clone()))
            .collect();

        let mut connections = Connections::new(
            Arc::new(broker),
            self.job_states.clone(),
            self.results.clone(),
            self.plugins.clone(),
        );
        for store in &stores {
            connections = connections.with_store(store.clone());
        }

        *self.current.lock() = stores;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(connections))
    }
}
