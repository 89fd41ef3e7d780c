// Rebalance engine and scheduler
//
// A rebalance round reads one snapshot of a subscription (definition, live
// sessions, topology version, current owners), computes the next assignment
// with the sticky strategy and persists every owner change in one multi-op
// transaction. The transaction carries:
//
// 1. a guard on the subscription node (deleted subscriptions are not revived)
// 2. a version check on every live session node (a session that expired
//    after the snapshot aborts the round)
// 3. the owner node writes and deletes
// 4. the topology node bump, last, as the ready-to-read marker
//
// Any conflict aborts the whole transaction; the round is then recomputed
// from a fresh read. Nothing is ever half-applied.
//
// Rounds of one subscription are serialized by a per-subscription lock held
// only around the round itself; rounds of different subscriptions run in
// parallel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::assignment::{
    moved_partitions, Assignment, AssignmentInput, AssignmentStrategy, StickyStrategy,
};
use super::broker::{partition_universe, EventLog};
use super::context::RuntimeContext;
use super::coordination::{paths, CoordinationStore, CreateMode, Op};
use super::error::{CoordinatorError, Result};
use super::locks::KeyedLocks;
use super::model::{parse_partition, EventTypePartition, Offset, StartFrom, Subscription, Topology};
use super::offsets::OffsetStore;
use super::registry::{definition_guard, guard_error, read_subscription};
use super::session::list_sessions;

/// Upper bound of the exponential backoff factor between retries
const MAX_BACKOFF_FACTOR: u32 = 32;

/// What a completed rebalance round did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceSummary {
    /// Topology generation after the round
    pub generation: u64,
    /// Assignment now persisted
    pub assignment: Assignment,
    /// Partitions whose owner changed
    pub moved: usize,
    /// Partitions that received an initial committed offset
    pub seeded: usize,
}

/// Current owners as persisted, walking the subscription's topics subtree
pub fn load_assignment(store: &dyn CoordinationStore, subscription_id: &str) -> Result<Assignment> {
    let mut assignment = Assignment::new();
    for event_type in store.children(&paths::topics(subscription_id))? {
        let parent = paths::event_type(subscription_id, &event_type);
        for partition in store.children(&parent)? {
            let Ok(partition) = parse_partition(&partition) else {
                continue;
            };
            let key = EventTypePartition::new(event_type.clone(), partition);
            if let Some(node) = store.get(&paths::partition_session(subscription_id, &key))? {
                assignment.insert(key, String::from_utf8_lossy(&node.data).into_owned());
            }
        }
    }
    Ok(assignment)
}

/// Current owner of one partition
pub fn load_owner(
    store: &dyn CoordinationStore,
    subscription_id: &str,
    key: &EventTypePartition,
) -> Result<Option<String>> {
    Ok(store
        .get(&paths::partition_session(subscription_id, key))?
        .map(|node| String::from_utf8_lossy(&node.data).into_owned()))
}

pub struct RebalanceEngine {
    store: Arc<dyn CoordinationStore>,
    log: Arc<dyn EventLog>,
    offsets: Arc<OffsetStore>,
    context: Arc<RuntimeContext>,
    strategy: Box<dyn AssignmentStrategy>,
    locks: KeyedLocks,
}

impl RebalanceEngine {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        log: Arc<dyn EventLog>,
        offsets: Arc<OffsetStore>,
        context: Arc<RuntimeContext>,
    ) -> Self {
        Self {
            store,
            log,
            offsets,
            context,
            strategy: Box::new(StickyStrategy::new()),
            locks: KeyedLocks::new(),
        }
    }

    /// Recompute and persist the assignment of a subscription
    ///
    /// Conflicts and store outages are retried from a fresh read with
    /// jittered exponential backoff, up to `rebalance_max_retries` times.
    pub async fn rebalance(&self, subscription_id: &str) -> Result<RebalanceSummary> {
        let _guard = self.locks.lock(subscription_id).await;
        let config = self.context.config();

        let mut attempt = 0u32;
        loop {
            match self.round(subscription_id) {
                Ok(summary) => return Ok(summary),
                Err(e) if e.is_retryable() && attempt < config.rebalance_max_retries => {
                    attempt += 1;
                    let delay = backoff(config.rebalance_retry_backoff(), attempt);
                    warn!(
                        "Rebalance retry: subscription_id={}, attempt={}, delay_ms={}, error={}",
                        subscription_id,
                        attempt,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if !matches!(e, CoordinatorError::SubscriptionNotFound(_)) {
                        error!(
                            "Rebalance abandoned: subscription_id={}, attempts={}, error={}",
                            subscription_id,
                            attempt + 1,
                            e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    /// One read-compute-write round
    fn round(&self, subscription_id: &str) -> Result<RebalanceSummary> {
        let store = self.store.as_ref();
        let subscription = read_subscription(store, subscription_id)?;

        let topology_path = paths::topology(subscription_id);
        let (topology, topology_version) = match store.get(&topology_path)? {
            Some(node) => (serde_json::from_slice::<Topology>(&node.data)?, Some(node.version)),
            None => (Topology::default(), None),
        };

        let sessions = list_sessions(store, subscription_id)?;
        let universe = partition_universe(self.log.as_ref(), &subscription.event_types)?;

        let mut previous = Assignment::new();
        let mut owner_versions: HashMap<EventTypePartition, u64> = HashMap::new();
        for key in &universe {
            if let Some(node) = store.get(&paths::partition_session(subscription_id, key))? {
                previous.insert(key.clone(), String::from_utf8_lossy(&node.data).into_owned());
                owner_versions.insert(key.clone(), node.version);
            }
        }

        let session_ids: Vec<String> = sessions
            .iter()
            .map(|live| live.session.session_id.clone())
            .collect();
        let next = self.strategy.assign(&AssignmentInput::new(
            session_ids,
            universe,
            previous.clone(),
        ));
        let moved = moved_partitions(&previous, &next);

        let mut generation = topology.generation;
        if moved.is_empty() {
            debug!(
                "Rebalance: no changes, subscription_id={}, generation={}, sessions={}",
                subscription_id,
                generation,
                sessions.len()
            );
        } else {
            generation += 1;
            let mut ops = vec![definition_guard(subscription_id)];
            ops.extend(sessions.iter().map(|live| Op::Check {
                path: paths::session(subscription_id, &live.session.session_id),
                version: live.version,
            }));
            for key in &moved {
                let path = paths::partition_session(subscription_id, key);
                let op = match (next.get(key), owner_versions.get(key)) {
                    (Some(owner), Some(version)) => Op::Set {
                        path,
                        data: owner.clone().into_bytes(),
                        version: Some(*version),
                    },
                    (Some(owner), None) => Op::Create {
                        path,
                        data: owner.clone().into_bytes(),
                        mode: CreateMode::Persistent,
                    },
                    (None, Some(version)) => Op::Delete {
                        path,
                        version: Some(*version),
                    },
                    (None, None) => continue,
                };
                ops.push(op);
            }
            let data = serde_json::to_vec(&Topology { generation })?;
            ops.push(match topology_version {
                Some(version) => Op::Set {
                    path: topology_path,
                    data,
                    version: Some(version),
                },
                None => Op::Create {
                    path: topology_path,
                    data,
                    mode: CreateMode::Persistent,
                },
            });

            self.store
                .multi(&ops)
                .map_err(|e| guard_error(e, subscription_id))?;

            info!(
                "Rebalance: subscription_id={}, strategy={}, generation={}, sessions={}, assigned={}, moved={}",
                subscription_id,
                self.strategy.name(),
                generation,
                sessions.len(),
                next.len(),
                moved.len()
            );
        }

        let seeded = self.seed_offsets(&subscription, &next)?;

        Ok(RebalanceSummary {
            generation,
            assignment: next,
            moved: moved.len(),
            seeded,
        })
    }

    /// Give every assigned partition without a committed offset its start position
    fn seed_offsets(&self, subscription: &Subscription, assignment: &Assignment) -> Result<usize> {
        let mut seeded = 0;
        for key in assignment.keys() {
            if self.offsets.get(&subscription.id, key)?.is_some() {
                continue;
            }
            let start = self.start_offset(subscription, key)?;
            if self.offsets.seed(&subscription.id, key, start)? {
                seeded += 1;
            }
        }
        Ok(seeded)
    }

    /// Offset a partition starts from when nothing was committed yet
    ///
    /// CURSORS subscriptions without a cursor for the partition start at END.
    pub fn start_offset(&self, subscription: &Subscription, key: &EventTypePartition) -> Result<Offset> {
        match subscription.start_from {
            StartFrom::Begin => self.log.earliest_offset(&key.event_type, key.partition),
            StartFrom::End => self.log.latest_offset(&key.event_type, key.partition),
            StartFrom::Cursors => match subscription.initial_offset(key) {
                Some(offset) => Ok(offset),
                None => self.log.latest_offset(&key.event_type, key.partition),
            },
        }
    }
}

/// Exponential backoff with up to 50% random jitter
fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32
        .saturating_pow(attempt.saturating_sub(1))
        .min(MAX_BACKOFF_FACTOR);
    let delay = base.saturating_mul(factor);
    let jitter_ms = (delay.as_millis() as u64) / 2;
    let jitter = if jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=jitter_ms)
    } else {
        0
    };
    delay + Duration::from_millis(jitter)
}

/// Debounces membership changes into rebalance rounds
///
/// `schedule` returns immediately. The first call for a subscription starts a
/// timer of `rebalance_debounce_ms`; further calls before it fires are
/// absorbed. Changes arriving while a round runs schedule the next one.
/// A round that fails on a store outage or conflict is tried again with
/// capped backoff until it succeeds, the subscription is gone or a newer
/// request is pending. Failures are logged and never reach clients.
pub struct RebalanceScheduler {
    engine: Arc<RebalanceEngine>,
    context: Arc<RuntimeContext>,
    pending: Arc<Mutex<HashSet<String>>>,
    shutdown: CancellationToken,
}

impl RebalanceScheduler {
    pub fn new(
        engine: Arc<RebalanceEngine>,
        context: Arc<RuntimeContext>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine,
            context,
            pending: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
        }
    }

    /// Request a rebalance of `subscription_id`
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, subscription_id: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if !self.pending.lock().insert(subscription_id.to_string()) {
            debug!(
                "Rebalance already pending: subscription_id={}",
                subscription_id
            );
            return;
        }

        let id = subscription_id.to_string();
        let engine = self.engine.clone();
        let pending = self.pending.clone();
        let shutdown = self.shutdown.clone();
        let config = self.context.config();
        let debounce = config.rebalance_debounce();
        let retry_backoff = config.rebalance_retry_backoff();
        let engine_retries = config.rebalance_max_retries;

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    pending.lock().remove(&id);
                    return;
                }
                _ = tokio::time::sleep(debounce) => {}
            }
            pending.lock().remove(&id);

            let mut failures = 0u32;
            loop {
                match engine.rebalance(&id).await {
                    Ok(summary) => {
                        debug!(
                            "Scheduled rebalance done: subscription_id={}, generation={}, moved={}",
                            id, summary.generation, summary.moved
                        );
                        return;
                    }
                    Err(CoordinatorError::SubscriptionNotFound(_)) => {
                        debug!("Skipped rebalance of deleted subscription: subscription_id={}", id);
                        return;
                    }
                    Err(e) if e.is_retryable() => {
                        failures += 1;
                        let delay = backoff(retry_backoff, engine_retries.saturating_add(failures));
                        warn!(
                            "Scheduled rebalance failed, retrying: subscription_id={}, failures={}, delay_ms={}, error={}",
                            id,
                            failures,
                            delay.as_millis(),
                            e
                        );
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        if pending.lock().contains(&id) {
                            debug!("Newer rebalance request takes over: subscription_id={}", id);
                            return;
                        }
                    }
                    Err(e) => {
                        error!("Scheduled rebalance failed: subscription_id={}, error={}", id, e);
                        return;
                    }
                }
            }
        });
    }

    /// True while a rebalance for the subscription waits for its debounce timer
    pub fn is_pending(&self, subscription_id: &str) -> bool {
        self.pending.lock().contains(subscription_id)
    }

    pub fn engine(&self) -> &Arc<RebalanceEngine> {
        &self.engine
    }
}
