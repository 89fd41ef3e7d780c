//! Streaming loop of a session
//!
//! `SubscriptionStream` pulls events for the partitions its session currently
//! owns. Ownership is re-read before every pull and again before a batch is
//! handed out, so a partition reassigned to another session stops yielding
//! data without ending the stream. The stream ends only when the session is
//! dissolved.
//!
//! Read positions are kept locally and start from the committed offset when
//! a partition is first seen. They are not authoritative: a new stream (or a
//! new owner) always resumes from the committed offset.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::broker::{EventLog, LogEvent};
use super::context::RuntimeContext;
use super::coordination::{paths, CoordinationStore, Watcher};
use super::error::Result;
use super::model::{EventTypePartition, Offset, SubscriptionCursor};
use super::offsets::OffsetStore;
use super::rebalance::{load_assignment, load_owner};
use super::session::SessionHandle;

/// Events of one partition plus the cursor to commit once they are processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamBatch {
    pub cursor: SubscriptionCursor,
    pub events: Vec<LogEvent>,
}

pub struct SubscriptionStream {
    session: SessionHandle,
    store: Arc<dyn CoordinationStore>,
    log: Arc<dyn EventLog>,
    offsets: Arc<OffsetStore>,
    context: Arc<RuntimeContext>,
    topology: Watcher,
    /// Next read position per owned partition (offset of the last event sent)
    positions: BTreeMap<EventTypePartition, Offset>,
    /// Partition served last, for round-robin between partitions
    last_served: Option<EventTypePartition>,
}

impl SubscriptionStream {
    pub fn new(
        session: SessionHandle,
        store: Arc<dyn CoordinationStore>,
        log: Arc<dyn EventLog>,
        offsets: Arc<OffsetStore>,
        context: Arc<RuntimeContext>,
    ) -> Result<Self> {
        let topology = store.watch(&paths::topology(session.subscription_id()))?;
        Ok(Self {
            session,
            store,
            log,
            offsets,
            context,
            topology,
            positions: BTreeMap::new(),
            last_served: None,
        })
    }

    pub fn session_id(&self) -> &str {
        self.session.session_id()
    }

    pub fn subscription_id(&self) -> &str {
        self.session.subscription_id()
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Partitions currently owned by this stream's session
    pub fn assigned_partitions(&self) -> Result<Vec<EventTypePartition>> {
        let assignment = load_assignment(self.store.as_ref(), self.subscription_id())?;
        Ok(assignment
            .into_iter()
            .filter(|(_, owner)| owner == self.session_id())
            .map(|(key, _)| key)
            .collect())
    }

    /// Wait for the next batch of events
    ///
    /// # Returns
    /// None once the session is dissolved
    pub async fn next_batch(&mut self) -> Result<Option<StreamBatch>> {
        let cancel = self.session.cancellation();
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            if let Some(batch) = self.poll_once()? {
                return Ok(Some(batch));
            }

            let poll_interval = self.context.config().stream_poll_interval();
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = self.topology.next() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Close the stream and leave the subscription
    pub fn close(self) -> Result<()> {
        self.session.close()
    }

    /// One pass over the owned partitions; first non-empty batch wins
    fn poll_once(&mut self) -> Result<Option<StreamBatch>> {
        let owned = self.assigned_partitions()?;
        self.positions.retain(|key, _| owned.contains(key));

        // Start after the partition served last
        let start = match &self.last_served {
            Some(last) => owned.iter().position(|key| key > last).unwrap_or(0),
            None => 0,
        };
        let batch_size = self.context.config().stream_batch_size;

        for key in owned[start..].iter().chain(owned[..start].iter()) {
            let position = match self.positions.get(key) {
                Some(position) => *position,
                None => match self.offsets.get(self.subscription_id(), key)? {
                    Some(committed) => committed,
                    // Not seeded yet; the rebalance round is still running
                    None => continue,
                },
            };

            let events = self
                .log
                .fetch(&key.event_type, key.partition, position, batch_size)?;
            let Some(last) = events.last().map(|event| event.offset) else {
                self.positions.insert(key.clone(), position);
                continue;
            };

            // Reassigned while reading: drop the data, keep the stream
            if load_owner(self.store.as_ref(), self.subscription_id(), key)?.as_deref()
                != Some(self.session_id())
            {
                debug!(
                    "Partition reassigned during pull: subscription_id={}, session_id={}, partition={}",
                    self.subscription_id(),
                    self.session_id(),
                    key
                );
                self.positions.remove(key);
                continue;
            }

            self.positions.insert(key.clone(), last);
            self.last_served = Some(key.clone());
            let cursor = SubscriptionCursor::new(
                key.event_type.clone(),
                key.partition.to_string(),
                last.to_string(),
            )
            .with_token(Uuid::new_v4().to_string());
            return Ok(Some(StreamBatch { cursor, events }));
        }

        Ok(None)
    }
}

impl std::fmt::Debug for SubscriptionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionStream")
            .field("session", &self.session)
            .field("positions", &self.positions)
            .finish()
    }
}
