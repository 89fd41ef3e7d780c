// Coordination store abstraction
//
// This module defines the CoordinationStore trait: the contract between the
// coordinator services and a linearizable hierarchical key-value store with
// ephemeral nodes and change notifications (ZooKeeper/etcd style).
//
// Separating the store from the coordination logic gives us:
// 1. Testability - services can be tested against MemoryStore or mocks
// 2. A single source of truth - no authoritative state lives in memory,
//    every service can be rebuilt from the store after a restart
// 3. Explicit concurrency - writers use versions and multi-op transactions
//    instead of process-local locks

use std::time::Duration;

use tokio::sync::broadcast;

use super::error::StoreError;

pub mod memory;
pub mod paths;


pub use memory::{spawn_lease_reaper, MemoryStore};

/// Result type for coordination store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Identifier of a lease granted by the store
pub type LeaseId = u64;

/// Lifetime of a created node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Lives until explicitly deleted
    Persistent,
    /// Deleted automatically when the lease expires or is revoked
    Ephemeral(LeaseId),
}

/// A node read from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Raw payload
    pub data: Vec<u8>,
    /// Incremented on every update; starts at 0
    pub version: u64,
    /// Store-wide creation sequence (orders nodes by creation time)
    pub created_seq: u64,
}

/// One step of an atomic multi-operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Fails the transaction unless the node exists with this version
    Check { path: String, version: u64 },
    /// Creates a node (parents are created on demand)
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    /// Updates a node, optionally guarded by its version
    Set {
        path: String,
        data: Vec<u8>,
        version: Option<u64>,
    },
    /// Deletes a leaf node, optionally guarded by its version
    Delete { path: String, version: Option<u64> },
}

/// Kind of change observed by a watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Changed,
    Deleted,
}

/// Change notification for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

/// Subscription to changes below a path prefix
///
/// Watchers are persistent: they keep delivering events until dropped.
/// If the watcher falls behind the store's notification buffer it yields a
/// synthetic `Changed` event for its own prefix so the consumer re-reads
/// whatever state it derives from the subtree.
pub struct Watcher {
    prefix: String,
    rx: broadcast::Receiver<WatchEvent>,
}

impl Watcher {
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<WatchEvent>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    /// Prefix this watcher observes
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wait for the next event under the prefix
    ///
    /// Returns None once the store is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if paths::is_within(&event.path, &self.prefix) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    return Some(WatchEvent {
                        path: self.prefix.clone(),
                        kind: WatchEventKind::Changed,
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").field("prefix", &self.prefix).finish()
    }
}

/// Abstract interface to the coordination store
///
/// Every method is one round trip. Implementations must be linearizable:
/// a successful write is visible to every subsequent read from any caller.
/// Unreachable stores and timeouts surface as `StoreError::Unavailable`.
pub trait CoordinationStore: Send + Sync {
    // ===== Node Operations =====

    /// Create a node, creating missing parents as empty persistent nodes
    ///
    /// # Errors
    /// `NodeExists` if the path is taken, `LeaseExpired` for an ephemeral
    /// node bound to a dead lease
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<()>;

    /// Read a node, None if absent
    fn get(&self, path: &str) -> StoreResult<Option<Node>>;

    /// Replace a node's payload
    ///
    /// # Arguments
    /// * `expected_version` - when Some, fail with `BadVersion` unless the
    ///   node currently has this version
    ///
    /// # Returns
    /// The node's new version
    fn set(&self, path: &str, data: &[u8], expected_version: Option<u64>) -> StoreResult<u64>;

    /// Delete a leaf node
    ///
    /// # Errors
    /// `NoNode`, `NotEmpty` when the node has children, `BadVersion`
    fn delete(&self, path: &str, expected_version: Option<u64>) -> StoreResult<()>;

    /// Delete a node and its whole subtree; absent paths are not an error
    fn delete_recursive(&self, path: &str) -> StoreResult<()>;

    /// Names (last path segment) of the direct children of a node, sorted
    ///
    /// An absent node has no children.
    fn children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Apply all operations atomically, or none of them
    fn multi(&self, ops: &[Op]) -> StoreResult<()>;

    // ===== Leases =====

    /// Grant a lease that expires unless renewed within `ttl`
    fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId>;

    /// Renew a lease for another full ttl
    ///
    /// # Errors
    /// `LeaseExpired` if the lease is already gone
    fn keep_alive(&self, lease: LeaseId) -> StoreResult<()>;

    /// Revoke a lease, deleting its ephemeral nodes; unknown leases are ignored
    fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()>;

    // ===== Notifications =====

    /// Observe creations, updates and deletions at or below `prefix`
    fn watch(&self, prefix: &str) -> StoreResult<Watcher>;
}
