// Subscription coordination module
//
// This module contains everything needed to let many stream consumers share
// a subscription:
// - Subscription registry (create, dedup, list, delete)
// - Streaming sessions bound to store leases
// - Partition assignment and the rebalance rounds that apply it
// - Cursor commits with per-item outcomes
//
// Architecture Overview:
// =====================
//
// All shared state lives in the coordination store:
//
//   /subscriptions/{id}                               definition (never updated)
//   /subscriptions/{id}/topology                      rebalance generation
//   /subscriptions/{id}/sessions/{session}            ephemeral, bound to a lease
//   /subscriptions/{id}/topics/{et}/{p}/session       current owner
//   /subscriptions/{id}/topics/{et}/{p}/offset        committed offset
//   /subscription_keys/{key}                          dedup key -> id
//
// Processes keep only caches and background tasks. Writers use versioned
// reads plus multi-op transactions, so any number of coordinator processes
// may serve the same subscription.
//
// Events flow from the `EventLog`; the coordinator never writes events.

pub mod assignment;
pub mod broker;
pub mod constants;
pub mod context;
pub mod coordination;
pub mod cursors;
pub mod error;
pub mod locks;
pub mod model;
pub mod offsets;
pub mod rebalance;
pub mod registry;
pub mod service;
pub mod session;
pub mod streaming;

// Re-export commonly used types for convenience
pub use broker::{EventLog, LogEvent, MemoryEventLog, PartitionStatistics};
pub use context::RuntimeContext;
pub use coordination::{CoordinationStore, MemoryStore};
pub use cursors::{CommitOutcome, CommitResult, CursorCommitResult};
pub use error::{CoordinatorError, Result, StoreError};
pub use model::{
    EventTypePartition, Offset, StartFrom, StreamSession, Subscription, SubscriptionCursor,
    SubscriptionDefinition,
};
pub use registry::{CreateOutcome, PageRequest, SubscriptionFilter, SubscriptionPage};
pub use service::SubscriptionService;
pub use streaming::{StreamBatch, SubscriptionStream};
