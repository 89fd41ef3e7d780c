// Event log abstraction
//
// The coordinator never stores events itself. It asks the partitioned log for
// event-type metadata (existence, partition count), for the offset range of a
// partition when seeding committed offsets, and for batches of events when
// streaming. EventLog is that boundary; MemoryEventLog is the in-process
// reference implementation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::Result;
use super::model::{EventTypePartition, Offset};

pub mod memory;

pub use memory::MemoryEventLog;

/// An event read from the log
///
/// The payload is opaque to the coordinator; it is handed to the client as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Position of this event in its partition
    pub offset: Offset,
    /// Time the event was appended
    pub published_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Offset range currently readable from one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStatistics {
    pub partition: u32,
    /// First offset that can still be read
    pub oldest_available: Offset,
    /// Offset of the newest event, `BEGIN` for an empty partition
    pub newest_available: Offset,
}

/// Abstract interface to the partitioned log
///
/// Unknown event types surface as `CoordinatorError::UnknownEventType`.
pub trait EventLog: Send + Sync {
    // ===== Metadata =====

    fn event_type_exists(&self, event_type: &str) -> Result<bool>;

    /// Number of partitions of an event type (fixed for its lifetime)
    fn partition_count(&self, event_type: &str) -> Result<u32>;

    /// Offset range of every partition, ordered by partition
    fn partition_statistics(&self, event_type: &str) -> Result<Vec<PartitionStatistics>>;

    // ===== Offsets =====

    /// Position just before the oldest readable event
    ///
    /// Committing or seeding this value makes the next read start at the
    /// oldest event still retained.
    fn earliest_offset(&self, event_type: &str, partition: u32) -> Result<Offset>;

    /// Offset of the newest event (`BEGIN` when the partition is empty)
    fn latest_offset(&self, event_type: &str, partition: u32) -> Result<Offset>;

    // ===== Reads =====

    /// Read up to `max` events with offsets strictly greater than `after`
    fn fetch(
        &self,
        event_type: &str,
        partition: u32,
        after: Offset,
        max: usize,
    ) -> Result<Vec<LogEvent>>;

    // ===== Lifecycle =====

    /// Remove an event type and its events
    ///
    /// Callers are expected to have checked that no subscription still
    /// references the event type.
    fn delete_event_type(&self, event_type: &str) -> Result<()>;
}

/// Every partition of the given event types, in partition-key order
pub fn partition_universe<'a, I>(log: &dyn EventLog, event_types: I) -> Result<Vec<EventTypePartition>>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut keys = Vec::new();
    for event_type in event_types {
        let count = log.partition_count(event_type)?;
        keys.extend((0..count).map(|p| EventTypePartition::new(event_type.clone(), p)));
    }
    keys.sort();
    Ok(keys)
}
