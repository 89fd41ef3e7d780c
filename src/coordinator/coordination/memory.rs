// In-memory implementation of the CoordinationStore trait
//
// MemoryStore keeps the whole node tree in a BTreeMap behind one mutex, which
// makes every operation trivially linearizable. It is the reference adapter
// used by the test-suite and by single-process deployments.
//
// Lease expiry is evaluated lazily at the start of every operation and,
// optionally, by a background reaper task so that watchers observe expired
// sessions even when nobody else touches the store.
//
// Deadlines use tokio::time::Instant so that tests running with a paused
// clock can expire leases deterministically via tokio::time::advance().

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    paths, CoordinationStore, CreateMode, LeaseId, Node, Op, StoreResult, WatchEvent,
    WatchEventKind, Watcher,
};
use crate::coordinator::error::StoreError;

/// Capacity of the notification buffer shared by all watchers
const WATCH_CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    version: u64,
    created_seq: u64,
    lease: Option<LeaseId>,
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
    next_seq: u64,
    next_lease: LeaseId,
}

/// In-memory, linearizable coordination store
pub struct MemoryStore {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            events,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing (false) or regaining (true) the store connection
    ///
    /// While unavailable every operation fails with `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Expire every lease whose deadline has passed
    ///
    /// # Returns
    /// Number of leases expired
    pub fn expire_leases(&self) -> usize {
        let mut events = Vec::new();
        let expired = {
            let mut state = self.state.lock();
            reap_expired(&mut state, &mut events)
        };
        self.publish(events);
        expired
    }

    /// Number of nodes in the tree (diagnostics)
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".into()))
        }
    }

    fn publish(&self, events: Vec<WatchEvent>) {
        for event in events {
            // No receivers is fine: nobody is watching
            let _ = self.events.send(event);
        }
    }

    /// Run `f` against the state after expiring dead leases, then publish events
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut State, &mut Vec<WatchEvent>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.ensure_available()?;
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock();
            reap_expired(&mut state, &mut events);
            f(&mut state, &mut events)
        };
        self.publish(events);
        result
    }
}

/// Spawn a task that expires dead leases every `interval` until cancelled
pub fn spawn_lease_reaper(
    store: Arc<MemoryStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Lease reaper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let expired = store.expire_leases();
                    if expired > 0 {
                        info!("Lease reaper expired {} lease(s)", expired);
                    }
                }
            }
        }
    })
}

fn reap_expired(state: &mut State, events: &mut Vec<WatchEvent>) -> usize {
    let now = Instant::now();
    let expired: Vec<LeaseId> = state
        .leases
        .iter()
        .filter(|(_, lease)| lease.deadline <= now)
        .map(|(id, _)| *id)
        .collect();

    for lease in &expired {
        state.leases.remove(lease);
        remove_lease_nodes(state, *lease, events);
    }
    expired.len()
}

fn remove_lease_nodes(state: &mut State, lease: LeaseId, events: &mut Vec<WatchEvent>) {
    let owned: Vec<String> = state
        .nodes
        .iter()
        .filter(|(_, entry)| entry.lease == Some(lease))
        .map(|(path, _)| path.clone())
        .collect();

    for path in owned {
        // Ephemeral nodes never have children, a plain remove is enough
        state.nodes.remove(&path);
        events.push(WatchEvent {
            path,
            kind: WatchEventKind::Deleted,
        });
    }
}

fn validate_path(path: &str) -> StoreResult<()> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') || path.contains("//") {
        return Err(StoreError::NoNode(path.to_string()));
    }
    Ok(())
}

fn has_children(nodes: &BTreeMap<String, Entry>, path: &str) -> bool {
    let prefix = format!("{}/", path);
    nodes
        .range(prefix.clone()..)
        .next()
        .map(|(key, _)| key.starts_with(&prefix))
        .unwrap_or(false)
}

fn check_version(path: &str, entry: &Entry, expected: Option<u64>) -> StoreResult<()> {
    match expected {
        Some(expected) if expected != entry.version => Err(StoreError::BadVersion {
            path: path.to_string(),
            expected,
            actual: entry.version,
        }),
        _ => Ok(()),
    }
}

fn apply_create(
    nodes: &mut BTreeMap<String, Entry>,
    next_seq: &mut u64,
    leases: &HashMap<LeaseId, Lease>,
    path: &str,
    data: &[u8],
    mode: CreateMode,
    events: &mut Vec<WatchEvent>,
) -> StoreResult<()> {
    validate_path(path)?;
    if nodes.contains_key(path) {
        return Err(StoreError::NodeExists(path.to_string()));
    }
    let lease = match mode {
        CreateMode::Persistent => None,
        CreateMode::Ephemeral(lease) => {
            if !leases.contains_key(&lease) {
                return Err(StoreError::LeaseExpired(lease));
            }
            Some(lease)
        }
    };

    // Create missing ancestors, outermost first
    let mut missing = Vec::new();
    let mut current = paths::parent(path);
    while let Some(parent) = current {
        if nodes.contains_key(parent) {
            break;
        }
        missing.push(parent.to_string());
        current = paths::parent(parent);
    }
    for parent in missing.into_iter().rev() {
        *next_seq += 1;
        nodes.insert(
            parent.clone(),
            Entry {
                data: Vec::new(),
                version: 0,
                created_seq: *next_seq,
                lease: None,
            },
        );
        events.push(WatchEvent {
            path: parent,
            kind: WatchEventKind::Created,
        });
    }

    *next_seq += 1;
    nodes.insert(
        path.to_string(),
        Entry {
            data: data.to_vec(),
            version: 0,
            created_seq: *next_seq,
            lease,
        },
    );
    events.push(WatchEvent {
        path: path.to_string(),
        kind: WatchEventKind::Created,
    });
    Ok(())
}

fn apply_set(
    nodes: &mut BTreeMap<String, Entry>,
    path: &str,
    data: &[u8],
    expected: Option<u64>,
    events: &mut Vec<WatchEvent>,
) -> StoreResult<u64> {
    let entry = nodes
        .get_mut(path)
        .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
    check_version(path, entry, expected)?;
    entry.data = data.to_vec();
    entry.version += 1;
    events.push(WatchEvent {
        path: path.to_string(),
        kind: WatchEventKind::Changed,
    });
    Ok(entry.version)
}

fn apply_delete(
    nodes: &mut BTreeMap<String, Entry>,
    path: &str,
    expected: Option<u64>,
    events: &mut Vec<WatchEvent>,
) -> StoreResult<()> {
    let entry = nodes
        .get(path)
        .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
    check_version(path, entry, expected)?;
    if has_children(nodes, path) {
        return Err(StoreError::NotEmpty(path.to_string()));
    }
    nodes.remove(path);
    events.push(WatchEvent {
        path: path.to_string(),
        kind: WatchEventKind::Deleted,
    });
    Ok(())
}

fn apply_check(nodes: &BTreeMap<String, Entry>, path: &str, version: u64) -> StoreResult<()> {
    let entry = nodes
        .get(path)
        .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
    check_version(path, entry, Some(version))
}

/// Prior contents of every path a transaction touched
struct UndoLog {
    saved: Vec<(String, Option<Entry>)>,
    next_seq: u64,
}

impl UndoLog {
    fn new(next_seq: u64) -> Self {
        Self {
            saved: Vec::new(),
            next_seq,
        }
    }

    fn record(&mut self, nodes: &BTreeMap<String, Entry>, path: &str) {
        self.saved.push((path.to_string(), nodes.get(path).cloned()));
    }

    /// Record `path` and every ancestor a create would add
    fn record_create(&mut self, nodes: &BTreeMap<String, Entry>, path: &str) {
        self.record(nodes, path);
        let mut current = paths::parent(path);
        while let Some(parent) = current {
            if nodes.contains_key(parent) {
                break;
            }
            self.saved.push((parent.to_string(), None));
            current = paths::parent(parent);
        }
    }

    /// Restore recorded paths, newest first, so the oldest snapshot wins
    fn rollback(self, nodes: &mut BTreeMap<String, Entry>, next_seq: &mut u64) {
        for (path, prior) in self.saved.into_iter().rev() {
            match prior {
                Some(entry) => {
                    nodes.insert(path, entry);
                }
                None => {
                    nodes.remove(&path);
                }
            }
        }
        *next_seq = self.next_seq;
    }
}

fn apply_ops(
    nodes: &mut BTreeMap<String, Entry>,
    next_seq: &mut u64,
    leases: &HashMap<LeaseId, Lease>,
    ops: &[Op],
    undo: &mut UndoLog,
    events: &mut Vec<WatchEvent>,
) -> StoreResult<()> {
    for op in ops {
        match op {
            Op::Check { path, version } => apply_check(nodes, path, *version)?,
            Op::Create { path, data, mode } => {
                undo.record_create(nodes, path);
                apply_create(nodes, next_seq, leases, path, data, *mode, events)?;
            }
            Op::Set {
                path,
                data,
                version,
            } => {
                undo.record(nodes, path);
                apply_set(nodes, path, data, *version, events)?;
            }
            Op::Delete { path, version } => {
                undo.record(nodes, path);
                apply_delete(nodes, path, *version, events)?;
            }
        }
    }
    Ok(())
}

impl CoordinationStore for MemoryStore {
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<()> {
        self.with_state(|state, events| {
            let State {
                nodes,
                leases,
                next_seq,
                ..
            } = state;
            apply_create(nodes, next_seq, leases, path, data, mode, events)
        })
    }

    fn get(&self, path: &str) -> StoreResult<Option<Node>> {
        self.with_state(|state, _| {
            Ok(state.nodes.get(path).map(|entry| Node {
                data: entry.data.clone(),
                version: entry.version,
                created_seq: entry.created_seq,
            }))
        })
    }

    fn set(&self, path: &str, data: &[u8], expected_version: Option<u64>) -> StoreResult<u64> {
        self.with_state(|state, events| {
            apply_set(&mut state.nodes, path, data, expected_version, events)
        })
    }

    fn delete(&self, path: &str, expected_version: Option<u64>) -> StoreResult<()> {
        self.with_state(|state, events| {
            apply_delete(&mut state.nodes, path, expected_version, events)
        })
    }

    fn delete_recursive(&self, path: &str) -> StoreResult<()> {
        self.with_state(|state, events| {
            let doomed: Vec<String> = state
                .nodes
                .keys()
                .filter(|key| paths::is_within(key, path))
                .cloned()
                .collect();
            // Deepest first so watchers see children vanish before parents
            for key in doomed.into_iter().rev() {
                state.nodes.remove(&key);
                events.push(WatchEvent {
                    path: key,
                    kind: WatchEventKind::Deleted,
                });
            }
            Ok(())
        })
    }

    fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.with_state(|state, _| {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            let names = state
                .nodes
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(key, _)| &key[prefix.len()..])
                .filter(|rest| !rest.contains('/'))
                .map(String::from)
                .collect();
            Ok(names)
        })
    }

    fn multi(&self, ops: &[Op]) -> StoreResult<()> {
        self.with_state(|state, events| {
            let State {
                nodes,
                leases,
                next_seq,
                ..
            } = state;
            let mut undo = UndoLog::new(*next_seq);
            let mut pending = Vec::new();

            match apply_ops(nodes, next_seq, leases, ops, &mut undo, &mut pending) {
                Ok(()) => {
                    events.extend(pending);
                    Ok(())
                }
                Err(e) => {
                    undo.rollback(nodes, next_seq);
                    Err(e)
                }
            }
        })
    }

    fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        self.with_state(|state, _| {
            state.next_lease += 1;
            let id = state.next_lease;
            state.leases.insert(
                id,
                Lease {
                    ttl,
                    deadline: Instant::now() + ttl,
                },
            );
            Ok(id)
        })
    }

    fn keep_alive(&self, lease: LeaseId) -> StoreResult<()> {
        self.with_state(|state, _| {
            let entry = state
                .leases
                .get_mut(&lease)
                .ok_or(StoreError::LeaseExpired(lease))?;
            entry.deadline = Instant::now() + entry.ttl;
            Ok(())
        })
    }

    fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        self.with_state(|state, events| {
            if state.leases.remove(&lease).is_some() {
                remove_lease_nodes(state, lease, events);
            }
            Ok(())
        })
    }

    fn watch(&self, prefix: &str) -> StoreResult<Watcher> {
        self.ensure_available()?;
        Ok(Watcher::new(prefix, self.events.subscribe()))
    }
}
