//! Offset store
//!
//! Durable (subscription, event type, partition) -> committed offset mapping
//! kept in the coordination store as the zero-padded decimal string. Writers
//! never lock: `advance` is a compare-and-set loop on the node version that
//! only ever moves the offset forward.

use std::sync::Arc;

use tracing::debug;

use super::coordination::{paths, CoordinationStore, CreateMode, Op};
use super::error::{CoordinatorError, Result, StoreError};
use super::model::{parse_partition, EventTypePartition, Offset};
use super::registry::{definition_guard, guard_error};

/// Outcome of an attempt to move an offset forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceResult {
    /// The stored offset now equals the requested one
    Committed,
    /// The stored offset was already at or beyond the requested one
    Outdated { current: Offset },
}

pub struct OffsetStore {
    store: Arc<dyn CoordinationStore>,
}

impl OffsetStore {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Committed offset of a partition, None if never committed or seeded
    pub fn get(&self, subscription_id: &str, key: &EventTypePartition) -> Result<Option<Offset>> {
        let path = paths::partition_offset(subscription_id, key);
        match self.store.get(&path)? {
            Some(node) => Ok(Some(decode(&node.data)?)),
            None => Ok(None),
        }
    }

    /// Store an initial offset unless one already exists
    ///
    /// # Returns
    /// true if the offset was written, false if the partition already had one
    pub fn seed(
        &self,
        subscription_id: &str,
        key: &EventTypePartition,
        offset: Offset,
    ) -> Result<bool> {
        match self.create(subscription_id, key, offset) {
            Ok(()) => {
                debug!(
                    "Seeded offset: subscription_id={}, partition={}, offset={}",
                    subscription_id, key, offset
                );
                Ok(true)
            }
            Err(CoordinatorError::Store(StoreError::NodeExists(_))) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Move the offset of a partition forward
    ///
    /// Writes only if `offset` is strictly greater than the stored value.
    /// Concurrent writers on the same partition are serialized by the node
    /// version: a lost race re-reads and compares again.
    pub fn advance(
        &self,
        subscription_id: &str,
        key: &EventTypePartition,
        offset: Offset,
    ) -> Result<AdvanceResult> {
        let path = paths::partition_offset(subscription_id, key);
        loop {
            match self.store.get(&path)? {
                None => match self.create(subscription_id, key, offset) {
                    Ok(()) => return Ok(AdvanceResult::Committed),
                    Err(CoordinatorError::Store(e)) if e.is_conflict() => continue,
                    Err(e) => return Err(e),
                },
                Some(node) => {
                    let current = decode(&node.data)?;
                    if offset <= current {
                        return Ok(AdvanceResult::Outdated { current });
                    }
                    match self
                        .store
                        .set(&path, offset.to_string().as_bytes(), Some(node.version))
                    {
                        Ok(_) => return Ok(AdvanceResult::Committed),
                        Err(e) if e.is_conflict() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Every stored offset of a subscription, in partition-key order
    pub fn list(&self, subscription_id: &str) -> Result<Vec<(EventTypePartition, Offset)>> {
        let mut offsets = Vec::new();
        for event_type in self.store.children(&paths::topics(subscription_id))? {
            let parent = paths::event_type(subscription_id, &event_type);
            for partition in self.store.children(&parent)? {
                let Ok(partition) = parse_partition(&partition) else {
                    continue;
                };
                let key = EventTypePartition::new(event_type.clone(), partition);
                if let Some(offset) = self.get(subscription_id, &key)? {
                    offsets.push((key, offset));
                }
            }
        }
        offsets.sort();
        Ok(offsets)
    }

    /// Create the offset node, failing if the subscription is gone
    fn create(&self, subscription_id: &str, key: &EventTypePartition, offset: Offset) -> Result<()> {
        self.store
            .multi(&[
                definition_guard(subscription_id),
                Op::Create {
                    path: paths::partition_offset(subscription_id, key),
                    data: offset.to_string().into_bytes(),
                    mode: CreateMode::Persistent,
                },
            ])
            .map_err(|e| guard_error(e, subscription_id))
    }
}

fn decode(data: &[u8]) -> Result<Offset> {
    let raw = std::str::from_utf8(data)
        .map_err(|_| CoordinatorError::Internal("stored offset is not UTF-8".into()))?;
    raw.parse()
        .map_err(|_| CoordinatorError::Internal(format!("stored offset is corrupt: '{}'", raw)))
}
