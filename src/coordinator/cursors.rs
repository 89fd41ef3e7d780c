//! Cursor commit service
//!
//! A commit carries the id of the committing session and a list of cursors.
//! Each cursor is judged on its own:
//!
//! 1. the partition must belong to one of the subscription's event types,
//!    otherwise `UnknownPartition`
//! 2. the committing session must be alive and currently own the partition,
//!    otherwise `SessionMismatch`
//! 3. the offset is written only if it moves the committed offset forward,
//!    otherwise `Outdated`
//!
//! One item failing never affects its siblings, and the results come back in
//! input order. Ownership is read at commit time, so a commit racing a
//! rebalance that just moved the partition away is rejected.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::broker::{partition_universe, EventLog};
use super::coordination::{paths, CoordinationStore};
use super::error::{CoordinatorError, Result};
use super::model::{EventTypePartition, Offset, SubscriptionCursor};
use super::offsets::{AdvanceResult, OffsetStore};
use super::rebalance::load_owner;
use super::registry::read_subscription;

/// Outcome of committing one cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitResult {
    /// Offset advanced to the committed value
    Committed,
    /// Stored offset already at or beyond the committed value; nothing written
    Outdated,
    /// Committing session does not own the partition (or is gone)
    SessionMismatch,
    /// Partition is not part of the subscription
    UnknownPartition,
}

/// Per-item result, echoing the cursor it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorCommitResult {
    pub cursor: SubscriptionCursor,
    pub result: CommitResult,
}

/// Results of one commit call, in input order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub items: Vec<CursorCommitResult>,
}

impl CommitOutcome {
    pub fn all_committed(&self) -> bool {
        self.items
            .iter()
            .all(|item| item.result == CommitResult::Committed)
    }

    /// 204 when every item was committed, otherwise 200 with the item list
    pub fn status_code(&self) -> u16 {
        if self.all_committed() {
            204
        } else {
            200
        }
    }
}

pub struct CursorCommitService {
    store: Arc<dyn CoordinationStore>,
    log: Arc<dyn EventLog>,
    offsets: Arc<OffsetStore>,
}

impl CursorCommitService {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        log: Arc<dyn EventLog>,
        offsets: Arc<OffsetStore>,
    ) -> Self {
        Self {
            store,
            log,
            offsets,
        }
    }

    /// Commit cursors on behalf of a session
    ///
    /// # Errors
    /// Only call-level problems: unknown subscription, an empty or malformed
    /// cursor list, or an unreachable store. Everything else is reported per
    /// item.
    pub fn commit(
        &self,
        session_id: &str,
        subscription_id: &str,
        cursors: &[SubscriptionCursor],
    ) -> Result<CommitOutcome> {
        if cursors.is_empty() {
            return Err(CoordinatorError::Validation(
                "at least one cursor is required".into(),
            ));
        }
        let subscription = read_subscription(self.store.as_ref(), subscription_id)?;
        let parsed: Vec<(EventTypePartition, Offset)> = cursors
            .iter()
            .map(SubscriptionCursor::parse)
            .collect::<Result<_>>()?;

        let universe: HashSet<EventTypePartition> =
            partition_universe(self.log.as_ref(), &subscription.event_types)?
                .into_iter()
                .collect();
        let alive = self
            .store
            .get(&paths::session(subscription_id, session_id))?
            .is_some();

        let mut items = Vec::with_capacity(cursors.len());
        for (cursor, (key, offset)) in cursors.iter().zip(parsed) {
            let result = if !universe.contains(&key) {
                CommitResult::UnknownPartition
            } else if !alive
                || load_owner(self.store.as_ref(), subscription_id, &key)?.as_deref()
                    != Some(session_id)
            {
                CommitResult::SessionMismatch
            } else {
                match self.offsets.advance(subscription_id, &key, offset)? {
                    AdvanceResult::Committed => CommitResult::Committed,
                    AdvanceResult::Outdated { .. } => CommitResult::Outdated,
                }
            };

            debug!(
                "Commit: subscription_id={}, session_id={}, partition={}, offset={}, result={:?}",
                subscription_id, session_id, key, offset, result
            );
            items.push(CursorCommitResult {
                cursor: cursor.clone(),
                result,
            });
        }

        Ok(CommitOutcome { items })
    }

    /// Committed offset of every partition that has one
    pub fn get_cursors(&self, subscription_id: &str) -> Result<Vec<SubscriptionCursor>> {
        read_subscription(self.store.as_ref(), subscription_id)?;
        Ok(self
            .offsets
            .list(subscription_id)?
            .into_iter()
            .map(|(key, offset)| {
                SubscriptionCursor::new(key.event_type, key.partition.to_string(), offset.to_string())
                    .with_token(Uuid::new_v4().to_string())
            })
            .collect())
    }
}
