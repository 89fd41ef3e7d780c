//! Test helper functions
//!
//! Fixtures over `MemoryStore` and `MemoryEventLog`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::mocks::fast_config;
use crate::config::Config;
use crate::coordinator::broker::MemoryEventLog;
use crate::coordinator::context::RuntimeContext;
use crate::coordinator::coordination::{paths, spawn_lease_reaper, CoordinationStore, CreateMode, MemoryStore};
use crate::coordinator::model::{Subscription, SubscriptionDefinition};
use crate::coordinator::offsets::OffsetStore;
use crate::coordinator::rebalance::{RebalanceEngine, RebalanceScheduler};
use crate::coordinator::registry::SubscriptionRegistry;
use crate::coordinator::session::SessionManager;

/// Store holding a bare subscription node, enough for offset operations
pub fn store_with_subscription(id: &str) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .create(&paths::subscription(id), b"{}", CreateMode::Persistent)
        .unwrap();
    store
}

/// Log with the given event types (name, partition count)
pub fn event_log(event_types: &[(&str, u32)]) -> Arc<MemoryEventLog> {
    let log = Arc::new(MemoryEventLog::new());
    for (name, partitions) in event_types {
        log.create_event_type(name, *partitions).unwrap();
    }
    log
}

pub struct RegistryFixture {
    pub store: Arc<MemoryStore>,
    pub log: Arc<MemoryEventLog>,
    pub registry: SubscriptionRegistry,
}

/// Registry over a fresh store and a log with the given event types
pub fn registry_fixture(event_types: &[(&str, u32)]) -> RegistryFixture {
    let store = Arc::new(MemoryStore::new());
    let log = event_log(event_types);
    let context = Arc::new(RuntimeContext::new(Config::default()));
    RegistryFixture {
        registry: SubscriptionRegistry::new(store.clone(), log.clone(), context),
        store,
        log,
    }
}

/// Sessions, scheduler and registry over one store, with a running reaper
///
/// Must be created inside a tokio runtime. Background tasks stop on drop.
pub struct CoordinatorFixture {
    pub config: Config,
    pub store: Arc<MemoryStore>,
    pub log: Arc<MemoryEventLog>,
    pub registry: SubscriptionRegistry,
    pub scheduler: Arc<RebalanceScheduler>,
    pub sessions: Arc<SessionManager>,
    shutdown: CancellationToken,
}

impl CoordinatorFixture {
    pub fn new(event_types: &[(&str, u32)]) -> Self {
        let config = fast_config();
        let context = Arc::new(RuntimeContext::new(config.clone()));
        let store = Arc::new(MemoryStore::new());
        let log = event_log(event_types);
        let shutdown = CancellationToken::new();

        let offsets = Arc::new(OffsetStore::new(store.clone()));
        let engine = Arc::new(RebalanceEngine::new(
            store.clone(),
            log.clone(),
            offsets,
            context.clone(),
        ));
        let scheduler = Arc::new(RebalanceScheduler::new(
            engine,
            context.clone(),
            shutdown.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            context.clone(),
            scheduler.clone(),
            shutdown.clone(),
        ));
        spawn_lease_reaper(store.clone(), config.lease_reap_interval(), shutdown.clone());

        Self {
            registry: SubscriptionRegistry::new(store.clone(), log.clone(), context),
            config,
            store,
            log,
            scheduler,
            sessions,
            shutdown,
        }
    }

    /// Create a subscription over the given event types
    pub async fn subscribe(&self, event_types: &[&str]) -> Subscription {
        self.registry
            .create(&SubscriptionDefinition::new("test-app", event_types.iter().copied()))
            .await
            .unwrap()
            .into_subscription()
    }
}

impl Drop for CoordinatorFixture {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Let debounced rebalances and renewals run
///
/// Under a paused clock this auto-advances time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}
