//! Subscription service
//!
//! Wires the registry, session manager, rebalance engine and scheduler,
//! commit service and event log together behind the operations a transport
//! layer exposes. Holds no authoritative state: a fresh service over the same
//! store sees every subscription, session, owner and offset.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::broker::{EventLog, PartitionStatistics};
use super::context::RuntimeContext;
use super::coordination::{spawn_lease_reaper, CoordinationStore, MemoryStore};
use super::cursors::{CommitOutcome, CursorCommitService};
use super::error::{CoordinatorError, Result};
use super::model::{StreamSession, Subscription, SubscriptionCursor, SubscriptionDefinition};
use super::offsets::OffsetStore;
use super::rebalance::{RebalanceEngine, RebalanceScheduler, RebalanceSummary};
use super::registry::{
    CreateOutcome, PageRequest, SubscriptionFilter, SubscriptionPage, SubscriptionRegistry,
};
use super::session::SessionManager;
use super::streaming::SubscriptionStream;

pub struct SubscriptionService {
    context: Arc<RuntimeContext>,
    store: Arc<dyn CoordinationStore>,
    log: Arc<dyn EventLog>,
    registry: SubscriptionRegistry,
    offsets: Arc<OffsetStore>,
    scheduler: Arc<RebalanceScheduler>,
    sessions: Arc<SessionManager>,
    cursors: CursorCommitService,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SubscriptionService {
    pub fn new(
        context: Arc<RuntimeContext>,
        store: Arc<dyn CoordinationStore>,
        log: Arc<dyn EventLog>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let offsets = Arc::new(OffsetStore::new(store.clone()));
        let engine = Arc::new(RebalanceEngine::new(
            store.clone(),
            log.clone(),
            offsets.clone(),
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

        Self {
            registry: SubscriptionRegistry::new(store.clone(), log.clone(), context.clone()),
            cursors: CursorCommitService::new(store.clone(), log.clone(), offsets.clone()),
            context,
            store,
            log,
            offsets,
            scheduler,
            sessions,
            shutdown,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Service over an in-process store, with its lease reaper running
    ///
    /// Must be called from within a tokio runtime.
    pub fn in_memory(
        context: Arc<RuntimeContext>,
        store: Arc<MemoryStore>,
        log: Arc<dyn EventLog>,
    ) -> Self {
        let interval = context.config().lease_reap_interval();
        let service = Self::new(context, store.clone(), log);
        let reaper = spawn_lease_reaper(store, interval, service.shutdown.child_token());
        service.background.lock().push(reaper);
        service
    }

    // ===== Subscriptions =====

    pub async fn create_subscription(&self, def: &SubscriptionDefinition) -> Result<CreateOutcome> {
        self.registry.create(def).await
    }

    pub fn get_subscription(&self, id: &str) -> Result<Subscription> {
        self.registry.get(id)
    }

    pub fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
        page: &PageRequest,
    ) -> Result<SubscriptionPage> {
        self.registry.list(filter, page)
    }

    /// Delete a subscription; its open streams end shortly after
    pub fn delete_subscription(&self, id: &str) -> Result<()> {
        self.registry.delete(id)
    }

    /// Event types of a subscription, for the caller's authorization check
    pub fn subscription_event_types(&self, id: &str) -> Result<BTreeSet<String>> {
        self.registry.event_types(id)
    }

    // ===== Sessions & Streaming =====

    /// Join a subscription and return a stream over the partitions it gets
    pub async fn open_stream(&self, subscription_id: &str) -> Result<SubscriptionStream> {
        let session = self.sessions.join(subscription_id).await?;
        SubscriptionStream::new(
            session,
            self.store.clone(),
            self.log.clone(),
            self.offsets.clone(),
            self.context.clone(),
        )
    }

    pub fn sessions(&self, subscription_id: &str) -> Result<Vec<StreamSession>> {
        self.sessions.sessions(subscription_id)
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    // ===== Cursors =====

    pub fn commit_cursors(
        &self,
        session_id: &str,
        subscription_id: &str,
        cursors: &[SubscriptionCursor],
    ) -> Result<CommitOutcome> {
        self.cursors.commit(session_id, subscription_id, cursors)
    }

    pub fn get_cursors(&self, subscription_id: &str) -> Result<Vec<SubscriptionCursor>> {
        self.cursors.get_cursors(subscription_id)
    }

    // ===== Event Types =====

    /// Offset range of every partition of an event type
    pub fn partitions(&self, event_type: &str) -> Result<Vec<PartitionStatistics>> {
        self.log.partition_statistics(event_type)
    }

    /// Delete an event type unless a subscription still references it
    pub fn delete_event_type(&self, event_type: &str) -> Result<()> {
        if !self.log.event_type_exists(event_type)? {
            return Err(CoordinatorError::UnknownEventType(event_type.to_string()));
        }
        self.registry.ensure_event_type_unreferenced(event_type)?;
        self.log.delete_event_type(event_type)
    }

    // ===== Rebalance =====

    /// Run a rebalance round now, bypassing the debounce timer
    pub async fn rebalance_now(&self, subscription_id: &str) -> Result<RebalanceSummary> {
        self.scheduler.engine().rebalance(subscription_id).await
    }

    // ===== Lifecycle =====

    /// Leave all local sessions and stop background tasks
    pub async fn shutdown(&self) {
        self.sessions.close_all();
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Subscription service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::broker::MemoryEventLog;
    use crate::testing::mocks::{fast_config, MockEventLog};

    fn context() -> Arc<RuntimeContext> {
        Arc::new(RuntimeContext::new(fast_config()))
    }

    #[tokio::test]
    async fn test_event_type_delete_waits_for_subscriptions() {
        let mut log = MockEventLog::new();
        log.expect_event_type_exists().returning(|_| Ok(true));
        log.expect_partition_count().returning(|_| Ok(2));
        log.expect_delete_event_type()
            .times(1)
            .returning(|_| Ok(()));

        let service = SubscriptionService::new(context(), Arc::new(MemoryStore::new()), Arc::new(log));
        let sub = service
            .create_subscription(&SubscriptionDefinition::new("app", ["orders"]))
            .await
            .unwrap()
            .into_subscription();

        let err = service.delete_event_type("orders").unwrap_err();
        assert!(matches!(err, CoordinatorError::Conflict(_)));
        assert_eq!(err.status_code(), 409);

        service.delete_subscription(&sub.id).unwrap();
        service.delete_event_type("orders").unwrap();
    }

    #[tokio::test]
    async fn test_unknown_event_type() {
        let service = SubscriptionService::new(
            context(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryEventLog::new()),
        );
        assert!(matches!(
            service.delete_event_type("ghost"),
            Err(CoordinatorError::UnknownEventType(_))
        ));
        assert!(matches!(
            service.partitions("ghost"),
            Err(CoordinatorError::UnknownEventType(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_streams() {
        let log = Arc::new(MemoryEventLog::new());
        log.create_event_type("orders", 2).unwrap();
        let store = Arc::new(MemoryStore::new());
        let service = SubscriptionService::in_memory(context(), store.clone(), log);
        let sub = service
            .create_subscription(&SubscriptionDefinition::new("app", ["orders"]))
            .await
            .unwrap()
            .into_subscription();

        let mut stream = service.open_stream(&sub.id).await.unwrap();
        assert_eq!(service.sessions(&sub.id).unwrap().len(), 1);

        service.shutdown().await;
        assert!(stream.next_batch().await.unwrap().is_none());
        assert!(service.sessions(&sub.id).unwrap().is_empty());
        assert_eq!(service.session_manager().local_count(), 0);
    }
}
