//! Subscription coordination and cursor-commit engine
//!
//! Lets a dynamic set of streaming sessions consume a subscription over one
//! or more partitioned event types. Each partition is owned by at most one
//! live session, sessions that disappear lose their partitions after a lease
//! timeout, and committed offsets only ever move forward.
//!
//! Entry point is [`SubscriptionService`], built over a [`CoordinationStore`]
//! and an [`EventLog`]. In-process implementations of both are provided.

pub mod config;
pub mod coordinator;

// Test utilities (only compiled in test builds)
#[cfg(test)]
pub mod testing;

pub use config::Config;
pub use coordinator::{
    CoordinationStore, CoordinatorError, EventLog, MemoryEventLog, MemoryStore, Result,
    RuntimeContext, SubscriptionService,
};
