//! In-memory partitioned log
//!
//! Offsets of a partition start at 0 and grow by one per published event.
//! `truncate` drops the head of a partition to emulate retention, which is
//! what makes `earliest_offset` differ from `BEGIN`.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use super::{EventLog, LogEvent, PartitionStatistics};
use crate::coordinator::error::{CoordinatorError, Result};
use crate::coordinator::model::Offset;

#[derive(Debug, Default)]
struct Partition {
    /// Offset of `events[0]`
    base: i64,
    events: Vec<LogEvent>,
}

impl Partition {
    fn next_offset(&self) -> i64 {
        self.base + self.events.len() as i64
    }

    fn statistics(&self, partition: u32) -> Result<PartitionStatistics> {
        let newest = match self.next_offset() {
            0 => Offset::BEGIN,
            next => Offset::new(next - 1)?,
        };
        Ok(PartitionStatistics {
            partition,
            oldest_available: Offset::new(self.base)?,
            newest_available: newest,
        })
    }
}

/// Thread-safe in-memory event log
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    event_types: RwLock<HashMap<String, Vec<Partition>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event type with a fixed number of partitions
    pub fn create_event_type(&self, name: &str, partitions: u32) -> Result<()> {
        if name.is_empty() || name.contains('/') {
            return Err(CoordinatorError::Validation(format!(
                "invalid event type name: '{}'",
                name
            )));
        }
        if partitions == 0 {
            return Err(CoordinatorError::Validation(
                "event type needs at least one partition".into(),
            ));
        }
        let mut event_types = self.event_types.write();
        if event_types.contains_key(name) {
            return Err(CoordinatorError::Conflict(format!(
                "event type '{}' already exists",
                name
            )));
        }
        event_types.insert(
            name.to_string(),
            (0..partitions).map(|_| Partition::default()).collect(),
        );
        debug!("Created event type: name={}, partitions={}", name, partitions);
        Ok(())
    }

    /// Append an event to a partition
    ///
    /// # Returns
    /// Offset assigned to the event
    pub fn publish(
        &self,
        event_type: &str,
        partition: u32,
        payload: serde_json::Value,
    ) -> Result<Offset> {
        let mut event_types = self.event_types.write();
        let target = partition_mut(&mut event_types, event_type, partition)?;
        let offset = Offset::new(target.next_offset())?;
        target.events.push(LogEvent {
            offset,
            published_at: Utc::now(),
            payload,
        });
        Ok(offset)
    }

    /// Drop every event with an offset lower than `keep_from`
    pub fn truncate(&self, event_type: &str, partition: u32, keep_from: Offset) -> Result<()> {
        let mut event_types = self.event_types.write();
        let target = partition_mut(&mut event_types, event_type, partition)?;
        let keep_from = keep_from.value().clamp(target.base, target.next_offset());
        let dropped = (keep_from - target.base) as usize;
        target.events.drain(..dropped);
        target.base = keep_from;
        Ok(())
    }

    fn with_partition<T>(
        &self,
        event_type: &str,
        partition: u32,
        f: impl FnOnce(&Partition) -> Result<T>,
    ) -> Result<T> {
        let event_types = self.event_types.read();
        let partitions = event_types
            .get(event_type)
            .ok_or_else(|| CoordinatorError::UnknownEventType(event_type.to_string()))?;
        let target = partitions.get(partition as usize).ok_or_else(|| {
            CoordinatorError::Validation(format!(
                "partition {} does not exist in event type '{}'",
                partition, event_type
            ))
        })?;
        f(target)
    }
}

fn partition_mut<'a>(
    event_types: &'a mut HashMap<String, Vec<Partition>>,
    event_type: &str,
    partition: u32,
) -> Result<&'a mut Partition> {
    event_types
        .get_mut(event_type)
        .ok_or_else(|| CoordinatorError::UnknownEventType(event_type.to_string()))?
        .get_mut(partition as usize)
        .ok_or_else(|| {
            CoordinatorError::Validation(format!(
                "partition {} does not exist in event type '{}'",
                partition, event_type
            ))
        })
}

impl EventLog for MemoryEventLog {
    fn event_type_exists(&self, event_type: &str) -> Result<bool> {
        Ok(self.event_types.read().contains_key(event_type))
    }

    fn partition_count(&self, event_type: &str) -> Result<u32> {
        self.event_types
            .read()
            .get(event_type)
            .map(|partitions| partitions.len() as u32)
            .ok_or_else(|| CoordinatorError::UnknownEventType(event_type.to_string()))
    }

    fn partition_statistics(&self, event_type: &str) -> Result<Vec<PartitionStatistics>> {
        let event_types = self.event_types.read();
        let partitions = event_types
            .get(event_type)
            .ok_or_else(|| CoordinatorError::UnknownEventType(event_type.to_string()))?;
        partitions
            .iter()
            .enumerate()
            .map(|(idx, p)| p.statistics(idx as u32))
            .collect()
    }

    fn earliest_offset(&self, event_type: &str, partition: u32) -> Result<Offset> {
        self.with_partition(event_type, partition, |p| match p.base {
            0 => Ok(Offset::BEGIN),
            base => Offset::new(base - 1),
        })
    }

    fn latest_offset(&self, event_type: &str, partition: u32) -> Result<Offset> {
        self.with_partition(event_type, partition, |p| {
            Ok(p.statistics(partition)?.newest_available)
        })
    }

    fn fetch(
        &self,
        event_type: &str,
        partition: u32,
        after: Offset,
        max: usize,
    ) -> Result<Vec<LogEvent>> {
        self.with_partition(event_type, partition, |p| {
            let start = (after.value() + 1 - p.base).max(0) as usize;
            Ok(p.events.iter().skip(start).take(max).cloned().collect())
        })
    }

    fn delete_event_type(&self, event_type: &str) -> Result<()> {
        match self.event_types.write().remove(event_type) {
            Some(_) => {
                debug!("Deleted event type: name={}", event_type);
                Ok(())
            }
            None => Err(CoordinatorError::UnknownEventType(event_type.to_string())),
        }
    }
}
