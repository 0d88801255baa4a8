use crate::server::{config::ServerConfig, telemetry::increment_pool_refills};
use anyhow::Context;
use core::time::Duration;
use idpool_tonic_core::idpool::{
    AllocationPage, AllocationQuery, ChannelPublisher, DispatchOrchestrator, DispatchSettings,
    DurableStore, Envelope, IdRecord, LockSettings, MemoryLockCoordinator, MemoryPoolCache,
    MemoryStore, MonotonicClock, Result, SearchQuery, async_trait,
};
use std::{path::Path, sync::Arc};
use tokio::sync::mpsc;

/// Orchestrator wired to the in-process backends.
pub type Orchestrator = DispatchOrchestrator<
    MemoryPoolCache,
    MeteredStore,
    MemoryLockCoordinator<MonotonicClock>,
    ChannelPublisher,
>;

/// [`MemoryStore`] that records every refill it serves.
pub struct MeteredStore {
    inner: Arc<MemoryStore>,
}

impl MeteredStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl DurableStore for MeteredStore {
    async fn fetch_unassigned(&self, limit: usize) -> Result<Vec<IdRecord>> {
        increment_pool_refills();
        self.inner.fetch_unassigned(limit).await
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<IdRecord>> {
        self.inner.search(query).await
    }

    async fn dispatched_to(&self, query: &AllocationQuery) -> Result<AllocationPage> {
        self.inner.dispatched_to(query).await
    }
}

/// Everything the server needs to run dispatches and drain their events.
pub struct Backends {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<MemoryStore>,
    pub events: mpsc::Receiver<Envelope>,
}

/// Builds the collaborators and, if configured, seeds the store.
pub async fn build_backends(config: &ServerConfig) -> anyhow::Result<Backends> {
    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &config.seed_file {
        let _seeded = seed_store(&store, path).await?;
        #[cfg(feature = "tracing")]
        tracing::info!("Seeded {} IDs from {}", _seeded, path.display());
    }

    let (orchestrator, events) = in_memory_orchestrator(
        Arc::clone(&store),
        config.dispatch.clone(),
        config.lock,
        config.event_buffer_size,
        config.publish_timeout,
    );

    Ok(Backends {
        orchestrator: Arc::new(orchestrator),
        store,
        events,
    })
}

/// Wires an [`Orchestrator`] around `store` with a fresh cache and lock
/// table. Cache claims expire with the lock lease. Events land on the
/// returned receiver.
pub fn in_memory_orchestrator(
    store: Arc<MemoryStore>,
    dispatch: DispatchSettings,
    lock: LockSettings,
    event_buffer_size: usize,
    publish_timeout: Duration,
) -> (Orchestrator, mpsc::Receiver<Envelope>) {
    let (publisher, events) = ChannelPublisher::new(event_buffer_size, publish_timeout);
    let orchestrator = DispatchOrchestrator::new(
        Arc::new(MemoryPoolCache::with_claim_ttl(lock.lease)),
        Arc::new(MeteredStore::new(store)),
        Arc::new(MemoryLockCoordinator::new(lock)),
        Arc::new(publisher),
        dispatch,
    );
    (orchestrator, events)
}

/// Loads one ID per line into `store`. Returns how many new IDs were added.
pub async fn seed_store(store: &MemoryStore, path: &Path) -> anyhow::Result<usize> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read seed file {}", path.display()))?;
    Ok(store.insert(parse_seed(&contents)))
}

fn parse_seed(contents: &str) -> impl Iterator<Item = IdRecord> + '_ {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(IdRecord::unassigned)
}
