//! Partition assignment
//!
//! This module defines the `AssignmentStrategy` trait and the sticky,
//! balanced strategy used by the rebalance engine. Strategies are pure:
//! given the same input they always return the same assignment, which is what
//! makes a rebalance round safe to repeat after a conflict.

pub mod sticky;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;

use super::model::EventTypePartition;

pub use sticky::StickyStrategy;

/// Partition -> owning session id; absent partitions are unassigned
pub type Assignment = BTreeMap<EventTypePartition, String>;

/// Snapshot a strategy computes from
#[derive(Debug, Clone, Default)]
pub struct AssignmentInput {
    /// Live session ids, oldest first
    pub sessions: Vec<String>,
    /// Partition universe of the subscription
    pub partitions: Vec<EventTypePartition>,
    /// Owners as last persisted (may name sessions that are gone)
    pub previous: Assignment,
}

impl AssignmentInput {
    pub fn new(
        sessions: Vec<String>,
        partitions: Vec<EventTypePartition>,
        previous: Assignment,
    ) -> Self {
        Self {
            sessions,
            partitions,
            previous,
        }
    }
}

/// Trait for partition assignment strategies
pub trait AssignmentStrategy: Send + Sync {
    /// Strategy name used in logs
    fn name(&self) -> &'static str;

    /// Compute the assignment for a membership snapshot
    fn assign(&self, input: &AssignmentInput) -> Assignment;
}

/// Number of partitions owned by each session, zero for sessions owning none
pub fn partition_counts<'a>(
    sessions: &'a [String],
    assignment: &Assignment,
) -> BTreeMap<&'a str, usize> {
    let mut counts: BTreeMap<&str, usize> =
        sessions.iter().map(|s| (s.as_str(), 0usize)).collect();
    for owner in assignment.values() {
        if let Some(count) = counts.get_mut(owner.as_str()) {
            *count += 1;
        }
    }
    counts
}

/// Partitions whose owner differs between two assignments
pub fn moved_partitions(previous: &Assignment, next: &Assignment) -> Vec<EventTypePartition> {
    let mut moved: Vec<EventTypePartition> = next
        .iter()
        .filter(|(key, owner)| previous.get(*key) != Some(*owner))
        .map(|(key, _)| key.clone())
        .collect();
    moved.extend(
        previous
            .keys()
            .filter(|key| !next.contains_key(*key))
            .cloned(),
    );
    moved.sort();
    moved
}

/// Partitions owned by one session, in key order
pub fn owned_by<'a>(assignment: &'a Assignment, session_id: &str) -> Vec<&'a EventTypePartition> {
    assignment
        .iter()
        .filter(|(_, owner)| owner.as_str() == session_id)
        .map(|(key, _)| key)
        .collect()
}
