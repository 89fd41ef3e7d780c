//! Subscription registry
//!
//! CRUD over subscription definitions stored at `/subscriptions/{id}`.
//!
//! Creation is idempotent per (owning application, event types, consumer
//! group): the triple is hex-encoded into a key node under
//! `/subscription_keys` that is created in the same transaction as the
//! subscription node, so two coordinators racing on the same definition
//! cannot both succeed. Inside one process, creates of the same key are also
//! serialized by a keyed lock so the loser reads the winner's record instead
//! of failing.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::EventLog;
use super::constants::SUBSCRIPTIONS_ROOT;
use super::context::RuntimeContext;
use super::coordination::{paths, CoordinationStore, CreateMode, Op};
use super::error::{CoordinatorError, Result, StoreError};
use super::locks::KeyedLocks;
use super::model::{StartFrom, Subscription, SubscriptionDefinition, Topology};

/// Result of `create`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new subscription was stored
    Created(Subscription),
    /// An identical subscription already existed and is returned unchanged
    Existing(Subscription),
}

impl CreateOutcome {
    pub fn subscription(&self) -> &Subscription {
        match self {
            CreateOutcome::Created(s) | CreateOutcome::Existing(s) => s,
        }
    }

    pub fn into_subscription(self) -> Subscription {
        match self {
            CreateOutcome::Created(s) | CreateOutcome::Existing(s) => s,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }

    /// 201 for a new subscription, 200 for an existing one
    pub fn status_code(&self) -> u16 {
        if self.is_created() {
            201
        } else {
            200
        }
    }
}

/// Optional filters of `list`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub owning_application: Option<String>,
    pub event_type: Option<String>,
}

impl SubscriptionFilter {
    fn matches(&self, subscription: &Subscription) -> bool {
        self.owning_application
            .as_ref()
            .map_or(true, |app| &subscription.owning_application == app)
            && self
                .event_type
                .as_ref()
                .map_or(true, |et| subscription.event_types.contains(et))
    }
}

/// Page request of `list`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// Page size, the configured default when None
    pub limit: Option<usize>,
    /// Continuation token returned with the previous page
    pub token: Option<String>,
}

/// One page of subscriptions, newest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionPage {
    pub items: Vec<Subscription>,
    /// Present when more subscriptions follow
    pub next_token: Option<String>,
}

/// Guard op that fails a transaction once the subscription is deleted
///
/// Subscription definitions are immutable, so their node stays at version 0
/// for its whole life.
pub(crate) fn definition_guard(subscription_id: &str) -> Op {
    Op::Check {
        path: paths::subscription(subscription_id),
        version: 0,
    }
}

/// Translate a failed guarded transaction into a service error
pub(crate) fn guard_error(err: StoreError, subscription_id: &str) -> CoordinatorError {
    match err {
        StoreError::NoNode(ref path) if *path == paths::subscription(subscription_id) => {
            CoordinatorError::SubscriptionNotFound(subscription_id.to_string())
        }
        other => other.into(),
    }
}

/// Read a subscription definition directly from the store
pub(crate) fn read_subscription(
    store: &dyn CoordinationStore,
    subscription_id: &str,
) -> Result<Subscription> {
    if !is_valid_id(subscription_id) {
        return Err(CoordinatorError::SubscriptionNotFound(
            subscription_id.to_string(),
        ));
    }
    match store.get(&paths::subscription(subscription_id))? {
        Some(node) => Ok(serde_json::from_slice(&node.data)?),
        None => Err(CoordinatorError::SubscriptionNotFound(
            subscription_id.to_string(),
        )),
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('/')
}

/// Content-addressed dedup key of a definition
fn dedup_key(owning_application: &str, event_types: &BTreeSet<String>, group: &str) -> String {
    let mut raw = Vec::new();
    raw.extend_from_slice(owning_application.as_bytes());
    raw.push(0);
    for (idx, event_type) in event_types.iter().enumerate() {
        if idx > 0 {
            raw.push(0x1f);
        }
        raw.extend_from_slice(event_type.as_bytes());
    }
    raw.push(0);
    raw.extend_from_slice(group.as_bytes());
    hex::encode(&raw)
}

/// Continuation token: `{created_at micros}_{id}`
fn encode_token(subscription: &Subscription) -> String {
    format!(
        "{}_{}",
        subscription.created_at.timestamp_micros(),
        subscription.id
    )
}

fn decode_token(token: &str) -> Result<(i64, String)> {
    let invalid =
        || CoordinatorError::Validation(format!("invalid continuation token: '{}'", token));
    let (micros, id) = token.split_once('_').ok_or_else(invalid)?;
    let micros = micros.parse::<i64>().map_err(|_| invalid())?;
    if id.is_empty() {
        return Err(invalid());
    }
    Ok((micros, id.to_string()))
}

fn sort_key(subscription: &Subscription) -> (i64, &str) {
    (
        subscription.created_at.timestamp_micros(),
        subscription.id.as_str(),
    )
}

pub struct SubscriptionRegistry {
    store: Arc<dyn CoordinationStore>,
    log: Arc<dyn EventLog>,
    context: Arc<RuntimeContext>,
    create_locks: KeyedLocks,
}

impl SubscriptionRegistry {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        log: Arc<dyn EventLog>,
        context: Arc<RuntimeContext>,
    ) -> Self {
        Self {
            store,
            log,
            context,
            create_locks: KeyedLocks::new(),
        }
    }

    // ===== Create =====

    /// Create a subscription, or return the identical one that already exists
    ///
    /// # Errors
    /// * `Validation` - malformed definition
    /// * `UnknownEventType` - an event type does not exist in the log
    /// * `PartitionLimitExceeded` - total partitions above the configured maximum
    pub async fn create(&self, def: &SubscriptionDefinition) -> Result<CreateOutcome> {
        self.validate(def)?;

        let group = def.effective_consumer_group().to_string();
        let key = dedup_key(&def.owning_application, &def.event_types, &group);
        let _guard = self.create_locks.lock(&key).await;

        loop {
            if let Some(existing) = self.lookup(&key)? {
                debug!(
                    "Subscription already exists: subscription_id={}, owning_application={}",
                    existing.id, existing.owning_application
                );
                return Ok(CreateOutcome::Existing(existing));
            }

            let subscription = Subscription {
                id: Uuid::new_v4().to_string(),
                owning_application: def.owning_application.clone(),
                event_types: def.event_types.clone(),
                consumer_group: group.clone(),
                start_from: def.start_from,
                initial_cursors: def.initial_cursors.clone(),
                created_at: Utc::now(),
            };

            let ops = [
                Op::Create {
                    path: paths::subscription(&subscription.id),
                    data: serde_json::to_vec(&subscription)?,
                    mode: CreateMode::Persistent,
                },
                Op::Create {
                    path: paths::topology(&subscription.id),
                    data: serde_json::to_vec(&Topology::default())?,
                    mode: CreateMode::Persistent,
                },
                Op::Create {
                    path: paths::subscription_key(&key),
                    data: subscription.id.clone().into_bytes(),
                    mode: CreateMode::Persistent,
                },
            ];

            match self.store.multi(&ops) {
                Ok(()) => {
                    info!(
                        "Created subscription: subscription_id={}, owning_application={}, event_types={:?}, consumer_group={}",
                        subscription.id,
                        subscription.owning_application,
                        subscription.event_types,
                        subscription.consumer_group
                    );
                    return Ok(CreateOutcome::Created(subscription));
                }
                // Another coordinator created the same definition first
                Err(StoreError::NodeExists(path)) if path == paths::subscription_key(&key) => {
                    continue
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn validate(&self, def: &SubscriptionDefinition) -> Result<()> {
        if def.owning_application.trim().is_empty() {
            return Err(CoordinatorError::Validation(
                "owning_application must not be empty".into(),
            ));
        }
        if def.event_types.is_empty() {
            return Err(CoordinatorError::Validation(
                "event_types must not be empty".into(),
            ));
        }
        if let Some(bad) = def
            .event_types
            .iter()
            .find(|et| et.is_empty() || et.contains('/'))
        {
            return Err(CoordinatorError::Validation(format!(
                "invalid event type name: '{}'",
                bad
            )));
        }

        let mut counts = Vec::with_capacity(def.event_types.len());
        for event_type in &def.event_types {
            if !self.log.event_type_exists(event_type)? {
                return Err(CoordinatorError::UnknownEventType(event_type.clone()));
            }
            counts.push((event_type.as_str(), self.log.partition_count(event_type)?));
        }

        let total: u32 = counts.iter().map(|(_, c)| *c).sum();
        let max = self.context.config().max_partitions;
        if total > max {
            return Err(CoordinatorError::PartitionLimitExceeded { actual: total, max });
        }

        match def.start_from {
            StartFrom::Cursors => validate_initial_cursors(def, &counts),
            _ if !def.initial_cursors.is_empty() => Err(CoordinatorError::Validation(
                "initial_cursors are only allowed with start_from=cursors".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Resolve a dedup key to its subscription, repairing a dangling index
    fn lookup(&self, key: &str) -> Result<Option<Subscription>> {
        let key_path = paths::subscription_key(key);
        let Some(node) = self.store.get(&key_path)? else {
            return Ok(None);
        };
        let id = String::from_utf8_lossy(&node.data).into_owned();
        match read_subscription(self.store.as_ref(), &id) {
            Ok(subscription) => Ok(Some(subscription)),
            Err(CoordinatorError::SubscriptionNotFound(_)) => {
                warn!(
                    "Removing dangling subscription key: key={}, subscription_id={}",
                    key, id
                );
                match self.store.delete(&key_path, Some(node.version)) {
                    Ok(()) | Err(StoreError::NoNode(_)) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e),
        }
    }

    // ===== Read =====

    pub fn get(&self, id: &str) -> Result<Subscription> {
        read_subscription(self.store.as_ref(), id)
    }

    /// Event types of a subscription, for the caller's authorization check
    pub fn event_types(&self, id: &str) -> Result<BTreeSet<String>> {
        Ok(self.get(id)?.event_types)
    }

    /// List subscriptions newest first
    ///
    /// The continuation token names the last item returned, so subscriptions
    /// created between two page requests never shift later pages.
    pub fn list(&self, filter: &SubscriptionFilter, page: &PageRequest) -> Result<SubscriptionPage> {
        let config = self.context.config();
        let limit = page.limit.unwrap_or(config.list_default_limit);
        if limit == 0 || limit > config.list_max_limit {
            return Err(CoordinatorError::Validation(format!(
                "limit must be between 1 and {}",
                config.list_max_limit
            )));
        }
        let after = page.token.as_deref().map(decode_token).transpose()?;

        let mut matching: Vec<Subscription> = self
            .all()?
            .into_iter()
            .filter(|s| filter.matches(s))
            .filter(|s| match &after {
                Some((micros, id)) => sort_key(s) < (*micros, id.as_str()),
                None => true,
            })
            .collect();
        matching.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));

        let has_more = matching.len() > limit;
        matching.truncate(limit);
        let next_token = if has_more {
            matching.last().map(encode_token)
        } else {
            None
        };

        Ok(SubscriptionPage {
            items: matching,
            next_token,
        })
    }

    /// Every stored subscription, in no particular order
    fn all(&self) -> Result<Vec<Subscription>> {
        let mut subscriptions = Vec::new();
        for id in self.store.children(SUBSCRIPTIONS_ROOT)? {
            match read_subscription(self.store.as_ref(), &id) {
                Ok(subscription) => subscriptions.push(subscription),
                // Deleted between listing and reading
                Err(CoordinatorError::SubscriptionNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(subscriptions)
    }

    // ===== Delete =====

    /// Delete a subscription with all its sessions, owners and offsets
    pub fn delete(&self, id: &str) -> Result<()> {
        let subscription = self.get(id)?;
        self.store.delete_recursive(&paths::subscription(id))?;

        let key = dedup_key(
            &subscription.owning_application,
            &subscription.event_types,
            &subscription.consumer_group,
        );
        match self.store.delete(&paths::subscription_key(&key), None) {
            Ok(()) | Err(StoreError::NoNode(_)) => {}
            Err(e) => return Err(e.into()),
        }

        info!("Deleted subscription: subscription_id={}", id);
        Ok(())
    }

    /// Fail with `Conflict` while any subscription references `event_type`
    ///
    /// Called by the owner of event types before deleting one.
    pub fn ensure_event_type_unreferenced(&self, event_type: &str) -> Result<()> {
        let referenced = self
            .all()?
            .iter()
            .any(|s| s.event_types.contains(event_type));
        if referenced {
            return Err(CoordinatorError::Conflict(
                "Not possible to remove event-type as it has subscriptions".into(),
            ));
        }
        Ok(())
    }
}

fn validate_initial_cursors(def: &SubscriptionDefinition, counts: &[(&str, u32)]) -> Result<()> {
    if def.initial_cursors.is_empty() {
        return Err(CoordinatorError::Validation(
            "initial_cursors are required with start_from=cursors".into(),
        ));
    }
    let mut seen = BTreeSet::new();
    for cursor in &def.initial_cursors {
        let (key, _) = cursor.parse()?;
        let Some((_, count)) = counts.iter().find(|(et, _)| *et == key.event_type) else {
            return Err(CoordinatorError::Validation(format!(
                "initial cursor event type '{}' is not part of the subscription",
                key.event_type
            )));
        };
        if key.partition >= *count {
            return Err(CoordinatorError::Validation(format!(
                "initial cursor partition {} does not exist",
                key
            )));
        }
        if !seen.insert(key.clone()) {
            return Err(CoordinatorError::Validation(format!(
                "duplicate initial cursor for partition {}",
                key
            )));
        }
    }
    Ok(())
}
