//! Session manager
//!
//! A streaming session is an ephemeral node under
//! `/subscriptions/{id}/sessions/{session_id}` bound to a store lease. The
//! session's connection handler owns a [`SessionHandle`]; while the handle is
//! alive a background task renews the lease every `heartbeat_interval_ms`.
//!
//! Liveness is entirely the store's business: if renewals stop (process
//! crash, dropped handle, network loss) the lease expires and the store
//! deletes the node. One membership watcher per subscription turns every
//! session node creation or deletion into a debounced rebalance, so an
//! expired session is handled exactly like one that left explicitly.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::RuntimeContext;
use super::coordination::{paths, CoordinationStore, CreateMode, LeaseId, Op, WatchEventKind, Watcher};
use super::error::{Result, StoreError};
use super::model::StreamSession;
use super::rebalance::RebalanceScheduler;
use super::registry::{definition_guard, guard_error, read_subscription};

/// A live session as read from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSession {
    pub session: StreamSession,
    /// Version of the session node
    pub version: u64,
    /// Store creation sequence of the session node
    pub created_seq: u64,
}

/// Live sessions of a subscription, oldest first (ties broken by id)
pub fn list_sessions(store: &dyn CoordinationStore, subscription_id: &str) -> Result<Vec<LiveSession>> {
    let mut sessions = Vec::new();
    for name in store.children(&paths::sessions(subscription_id))? {
        // Expired between listing and reading
        let Some(node) = store.get(&paths::session(subscription_id, &name))? else {
            continue;
        };
        sessions.push(LiveSession {
            session: serde_json::from_slice(&node.data)?,
            version: node.version,
            created_seq: node.created_seq,
        });
    }
    sessions.sort_by(|a, b| {
        a.created_seq
            .cmp(&b.created_seq)
            .then_with(|| a.session.session_id.cmp(&b.session.session_id))
    });
    Ok(sessions)
}

struct LocalSession {
    subscription_id: String,
    lease: LeaseId,
    stop: CancellationToken,
    dissolved: CancellationToken,
}

pub struct SessionManager {
    store: Arc<dyn CoordinationStore>,
    context: Arc<RuntimeContext>,
    scheduler: Arc<RebalanceScheduler>,
    /// Sessions joined through this process
    local: Arc<Mutex<HashMap<String, LocalSession>>>,
    /// Subscriptions with a running membership watcher
    watched: Arc<Mutex<HashSet<String>>>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        context: Arc<RuntimeContext>,
        scheduler: Arc<RebalanceScheduler>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            context,
            scheduler,
            local: Arc::new(Mutex::new(HashMap::new())),
            watched: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
        }
    }

    // ===== Join / Leave =====

    /// Revoke the lease of a join that did not complete
    ///
    /// A failure leaves the lease to expire on its own.
    fn release_lease(&self, subscription_id: &str, lease: LeaseId) {
        if let Err(e) = self.store.revoke_lease(lease) {
            warn!(
                "Failed to revoke lease of abandoned join: subscription_id={}, lease={}, error={}",
                subscription_id, lease, e
            );
        }
    }

    /// Register a new streaming session on a subscription
    ///
    /// # Returns
    /// A handle that keeps the session alive until closed or dropped
    pub async fn join(self: &Arc<Self>, subscription_id: &str) -> Result<SessionHandle> {
        let config = self.context.config();
        read_subscription(self.store.as_ref(), subscription_id)?;

        let session = StreamSession {
            session_id: Uuid::new_v4().to_string(),
            subscription_id: subscription_id.to_string(),
            created_at: Utc::now(),
        };
        let data = serde_json::to_vec(&session)?;
        let path = paths::session(subscription_id, &session.session_id);

        // Watch before creating so a deletion right after creation is seen
        let node_watcher = self.store.watch(&path)?;
        let lease = self.store.grant_lease(config.session_timeout())?;
        let created = self.store.multi(&[
            definition_guard(subscription_id),
            Op::Create {
                path: path.clone(),
                data,
                mode: CreateMode::Ephemeral(lease),
            },
        ]);
        if let Err(e) = created {
            self.release_lease(subscription_id, lease);
            return Err(guard_error(e, subscription_id));
        }

        if let Err(e) = self.ensure_membership_watcher(subscription_id) {
            self.release_lease(subscription_id, lease);
            return Err(e);
        }

        let stop = self.shutdown.child_token();
        let dissolved = CancellationToken::new();
        self.local.lock().insert(
            session.session_id.clone(),
            LocalSession {
                subscription_id: subscription_id.to_string(),
                lease,
                stop: stop.clone(),
                dissolved: dissolved.clone(),
            },
        );

        tokio::spawn(renew_lease(
            self.store.clone(),
            self.local.clone(),
            RenewalTask {
                session_id: session.session_id.clone(),
                subscription_id: subscription_id.to_string(),
                path,
                lease,
                interval: config.heartbeat_interval(),
                stop: stop.clone(),
                dissolved: dissolved.clone(),
                watcher: node_watcher,
            },
        ));

        self.scheduler.schedule(subscription_id);
        info!(
            "Session joined: subscription_id={}, session_id={}",
            subscription_id, session.session_id
        );

        Ok(SessionHandle {
            session_id: session.session_id,
            subscription_id: subscription_id.to_string(),
            dissolved,
            manager: self.clone(),
            _renewal: stop.drop_guard(),
        })
    }

    /// Remove a session explicitly
    ///
    /// Leaving an unknown or already departed session is a no-op.
    pub fn leave(&self, session_id: &str) -> Result<()> {
        let Some(local) = self.local.lock().remove(session_id) else {
            debug!("Leave of unknown session ignored: session_id={}", session_id);
            return Ok(());
        };
        local.stop.cancel();
        local.dissolved.cancel();

        let revoked = self.store.revoke_lease(local.lease);
        self.scheduler.schedule(&local.subscription_id);
        revoked?;

        info!(
            "Session left: subscription_id={}, session_id={}",
            local.subscription_id, session_id
        );
        Ok(())
    }

    /// Leave every session joined through this manager
    pub fn close_all(&self) {
        let ids: Vec<String> = self.local.lock().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.leave(&id) {
                warn!("Failed to close session: session_id={}, error={}", id, e);
            }
        }
    }

    // ===== Queries =====

    /// Live sessions of a subscription, oldest first
    pub fn sessions(&self, subscription_id: &str) -> Result<Vec<StreamSession>> {
        read_subscription(self.store.as_ref(), subscription_id)?;
        Ok(list_sessions(self.store.as_ref(), subscription_id)?
            .into_iter()
            .map(|live| live.session)
            .collect())
    }

    /// Whether the session node currently exists
    pub fn is_alive(&self, subscription_id: &str, session_id: &str) -> Result<bool> {
        Ok(self
            .store
            .get(&paths::session(subscription_id, session_id))?
            .is_some())
    }

    /// Number of sessions joined through this manager that are still running
    pub fn local_count(&self) -> usize {
        self.local.lock().len()
    }

    // ===== Membership Watch =====

    /// Start the membership watcher of a subscription unless one is running
    fn ensure_membership_watcher(&self, subscription_id: &str) -> Result<()> {
        if !self.watched.lock().insert(subscription_id.to_string()) {
            return Ok(());
        }
        let watcher = match self.store.watch(&paths::subscription(subscription_id)) {
            Ok(watcher) => watcher,
            Err(e) => {
                self.watched.lock().remove(subscription_id);
                return Err(e.into());
            }
        };

        tokio::spawn(watch_membership(
            subscription_id.to_string(),
            watcher,
            self.scheduler.clone(),
            self.watched.clone(),
            self.shutdown.clone(),
        ));
        Ok(())
    }
}

async fn watch_membership(
    subscription_id: String,
    mut watcher: Watcher,
    scheduler: Arc<RebalanceScheduler>,
    watched: Arc<Mutex<HashSet<String>>>,
    shutdown: CancellationToken,
) {
    let subscription_path = paths::subscription(&subscription_id);
    let sessions_path = paths::sessions(&subscription_id);
    debug!("Membership watcher started: subscription_id={}", subscription_id);

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = watcher.next() => event,
        };
        let Some(event) = event else {
            break;
        };

        if event.path == subscription_path {
            match event.kind {
                WatchEventKind::Deleted => break,
                // Lagged watcher: membership may have changed unseen
                WatchEventKind::Changed => scheduler.schedule(&subscription_id),
                WatchEventKind::Created => {}
            }
        } else if paths::parent(&event.path) == Some(sessions_path.as_str())
            && event.kind != WatchEventKind::Changed
        {
            info!(
                "Membership change: subscription_id={}, session_id={}, kind={:?}",
                subscription_id,
                paths::name(&event.path),
                event.kind
            );
            scheduler.schedule(&subscription_id);
        }
    }

    watched.lock().remove(&subscription_id);
    debug!("Membership watcher stopped: subscription_id={}", subscription_id);
}

struct RenewalTask {
    session_id: String,
    subscription_id: String,
    path: String,
    lease: LeaseId,
    interval: std::time::Duration,
    stop: CancellationToken,
    dissolved: CancellationToken,
    watcher: Watcher,
}

/// Renew the session lease until stopped or the session node disappears
async fn renew_lease(
    store: Arc<dyn CoordinationStore>,
    local: Arc<Mutex<HashMap<String, LocalSession>>>,
    mut task: RenewalTask,
) {
    let start = tokio::time::Instant::now() + task.interval;
    let mut ticker = tokio::time::interval_at(start, task.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = task.stop.cancelled() => break,
            _ = ticker.tick() => match store.keep_alive(task.lease) {
                Ok(()) => {}
                Err(StoreError::LeaseExpired(_)) => {
                    warn!(
                        "Session lease expired: subscription_id={}, session_id={}",
                        task.subscription_id, task.session_id
                    );
                    break;
                }
                Err(e) => warn!(
                    "Session keep-alive failed: subscription_id={}, session_id={}, error={}",
                    task.subscription_id, task.session_id, e
                ),
            },
            event = task.watcher.next() => match event {
                Some(event) if event.path == task.path => {
                    let gone = match event.kind {
                        WatchEventKind::Deleted => true,
                        WatchEventKind::Created => false,
                        // Lagged: re-read to find out
                        WatchEventKind::Changed => matches!(store.get(&task.path), Ok(None)),
                    };
                    if gone {
                        info!(
                            "Session dissolved: subscription_id={}, session_id={}",
                            task.subscription_id, task.session_id
                        );
                        break;
                    }
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    task.dissolved.cancel();
    local.lock().remove(&task.session_id);
}

/// Owner's handle of a live session
///
/// Dropping the handle stops lease renewal without deleting the session
/// node; the store expires it after `session_timeout_ms`, as it would after a
/// lost connection. Use [`SessionHandle::close`] to leave immediately.
pub struct SessionHandle {
    session_id: String,
    subscription_id: String,
    dissolved: CancellationToken,
    manager: Arc<SessionManager>,
    _renewal: DropGuard,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Token cancelled once the session is gone for good
    pub fn cancellation(&self) -> CancellationToken {
        self.dissolved.clone()
    }

    pub fn is_dissolved(&self) -> bool {
        self.dissolved.is_cancelled()
    }

    /// Leave the subscription and delete the session node
    pub fn close(self) -> Result<()> {
        self.manager.leave(&self.session_id)
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("subscription_id", &self.subscription_id)
            .field("dissolved", &self.is_dissolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::broadcast;

    use crate::coordinator::broker::MemoryEventLog;
    use crate::coordinator::coordination::Node;
    use crate::coordinator::error::CoordinatorError;
    use crate::coordinator::model::{StartFrom, Subscription};
    use crate::coordinator::offsets::OffsetStore;
    use crate::coordinator::rebalance::{load_assignment, RebalanceEngine};
    use crate::testing::helpers::{settle, CoordinatorFixture};
    use crate::testing::mocks::{fast_config, MockCoordinationStore};

    #[tokio::test(start_paused = true)]
    async fn test_join_creates_session_and_assigns() {
        let f = CoordinatorFixture::new(&[("orders", 2)]);
        let sub = f.subscribe(&["orders"]).await;

        let handle = f.sessions.join(&sub.id).await.unwrap();
        assert!(f.sessions.is_alive(&sub.id, handle.session_id()).unwrap());
        settle().await;

        let assignment = load_assignment(f.store.as_ref(), &sub.id).unwrap();
        assert_eq!(assignment.len(), 2);
        assert!(assignment.values().all(|owner| owner == handle.session_id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_unknown_subscription() {
        let f = CoordinatorFixture::new(&[("orders", 2)]);
        let err = f.sessions.join("missing").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::SubscriptionNotFound(_)));
        assert!(f.store.children("/subscriptions").unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_ordered_oldest_first() {
        let f = CoordinatorFixture::new(&[("orders", 2)]);
        let sub = f.subscribe(&["orders"]).await;

        let first = f.sessions.join(&sub.id).await.unwrap();
        let second = f.sessions.join(&sub.id).await.unwrap();
        let third = f.sessions.join(&sub.id).await.unwrap();

        let ids: Vec<String> = f
            .sessions
            .sessions(&sub.id)
            .unwrap()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(
            ids,
            vec![
                first.session_id().to_string(),
                second.session_id().to_string(),
                third.session_id().to_string()
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_is_idempotent() {
        let f = CoordinatorFixture::new(&[("orders", 2)]);
        let sub = f.subscribe(&["orders"]).await;
        let handle = f.sessions.join(&sub.id).await.unwrap();
        let session_id = handle.session_id().to_string();
        let token = handle.cancellation();

        f.sessions.leave(&session_id).unwrap();
        f.sessions.leave(&session_id).unwrap();
        assert!(token.is_cancelled());
        assert!(!f.sessions.is_alive(&sub.id, &session_id).unwrap());
        assert_eq!(f.sessions.local_count(), 0);

        // Closing the handle afterwards is also a no-op
        handle.close().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_session_alive() {
        let f = CoordinatorFixture::new(&[("orders", 2)]);
        let sub = f.subscribe(&["orders"]).await;
        let handle = f.sessions.join(&sub.id).await.unwrap();

        tokio::time::sleep(f.config.session_timeout() * 5).await;
        assert!(f.sessions.is_alive(&sub.id, handle.session_id()).unwrap());
        assert!(!handle.is_dissolved());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_expires_and_rebalances() {
        let f = CoordinatorFixture::new(&[("orders", 2)]);
        let sub = f.subscribe(&["orders"]).await;

        let survivor = f.sessions.join(&sub.id).await.unwrap();
        let crashed = f.sessions.join(&sub.id).await.unwrap();
        let crashed_id = crashed.session_id().to_string();
        settle().await;
        let before = load_assignment(f.store.as_ref(), &sub.id).unwrap();
        assert!(before.values().any(|owner| *owner == crashed_id));

        // Connection loss: no explicit leave
        drop(crashed);
        tokio::time::sleep(f.config.session_timeout() * 2).await;
        settle().await;

        assert!(!f.sessions.is_alive(&sub.id, &crashed_id).unwrap());
        let after = load_assignment(f.store.as_ref(), &sub.id).unwrap();
        assert_eq!(after.len(), 2);
        assert!(after.values().all(|owner| owner == survivor.session_id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_node_dissolves_handle() {
        let f = CoordinatorFixture::new(&[("orders", 2)]);
        let sub = f.subscribe(&["orders"]).await;
        let handle = f.sessions.join(&sub.id).await.unwrap();
        let token = handle.cancellation();

        f.store
            .delete(&paths::session(&sub.id, handle.session_id()), None)
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert_eq!(f.sessions.local_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_outage_expires_session() {
        let f = CoordinatorFixture::new(&[("orders", 2)]);
        let sub = f.subscribe(&["orders"]).await;
        let handle = f.sessions.join(&sub.id).await.unwrap();
        let token = handle.cancellation();

        f.store.set_available(false);
        tokio::time::sleep(f.config.session_timeout() * 2).await;
        f.store.set_available(true);

        // The first renewal after the outage finds the lease gone
        tokio::time::timeout(f.config.session_timeout(), token.cancelled())
            .await
            .unwrap();
        assert!(!f.sessions.is_alive(&sub.id, handle.session_id()).unwrap());
    }

    #[tokio::test]
    async fn test_failed_join_revokes_lease_once() {
        let subscription = Subscription {
            id: "sub-1".to_string(),
            owning_application: "app".to_string(),
            event_types: ["orders".to_string()].into_iter().collect(),
            consumer_group: "default".to_string(),
            start_from: StartFrom::End,
            initial_cursors: Vec::new(),
            created_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&subscription).unwrap();

        let mut store = MockCoordinationStore::new();
        store.expect_get().returning(move |_| {
            Ok(Some(Node {
                data: payload.clone(),
                version: 0,
                created_seq: 1,
            }))
        });
        store
            .expect_watch()
            .returning(|prefix| Ok(Watcher::new(prefix, broadcast::channel(1).1)));
        store.expect_grant_lease().returning(|_| Ok(7));
        store
            .expect_multi()
            .returning(|_| Err(StoreError::Unavailable("connection lost".into())));
        // The revoke failure is logged, the join error is what the caller sees
        store
            .expect_revoke_lease()
            .times(1)
            .returning(|_| Err(StoreError::Unavailable("connection lost".into())));

        let store: Arc<dyn CoordinationStore> = Arc::new(store);
        let context = Arc::new(RuntimeContext::new(fast_config()));
        let shutdown = CancellationToken::new();
        let engine = Arc::new(RebalanceEngine::new(
            store.clone(),
            Arc::new(MemoryEventLog::new()),
            Arc::new(OffsetStore::new(store.clone())),
            context.clone(),
        ));
        let scheduler = Arc::new(RebalanceScheduler::new(
            engine,
            context.clone(),
            shutdown.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(store, context, scheduler, shutdown));

        let err = sessions.join("sub-1").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::StoreUnavailable(_)));
        assert_eq!(sessions.local_count(), 0);
    }
}
