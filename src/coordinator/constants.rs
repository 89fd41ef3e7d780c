//! Coordinator constants
//!
//! This module centralizes the limits, defaults and store layout names used by
//! the subscription coordinator. Configuration bounds follow the pattern
//! `DEFAULT_*` / `MIN_*` / `MAX_*` and are enforced by `Config::load()`.

// ===== Subscription Limits =====

/// Maximum total partition count across all event types of one subscription
pub const DEFAULT_MAX_PARTITIONS: u32 = 30;

/// Lower bound for the configurable partition limit
pub const MIN_MAX_PARTITIONS: u32 = 1;

/// Upper bound for the configurable partition limit
pub const MAX_MAX_PARTITIONS: u32 = 10_000;

/// Consumer group used when a subscription definition does not name one
///
/// Must be deterministic: two POSTs of the same definition without a group
/// have to resolve to the same logical subscription.
pub const DEFAULT_CONSUMER_GROUP: &str = "default";

// ===== Session Liveness =====

/// Default session lease timeout (milliseconds)
///
/// A session whose lease is not renewed within this period is expired by
/// the coordination store and removed from the subscription.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30_000;

/// Minimum session lease timeout (milliseconds)
pub const MIN_SESSION_TIMEOUT_MS: u64 = 100;

/// Maximum session lease timeout (milliseconds)
pub const MAX_SESSION_TIMEOUT_MS: u64 = 600_000;

/// Default lease renewal interval (milliseconds)
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// Minimum lease renewal interval (milliseconds)
pub const MIN_HEARTBEAT_INTERVAL_MS: u64 = 10;

/// Maximum lease renewal interval (milliseconds)
pub const MAX_HEARTBEAT_INTERVAL_MS: u64 = 120_000;

/// Default interval of the background lease reaper (milliseconds)
pub const DEFAULT_LEASE_REAP_INTERVAL_MS: u64 = 1_000;

/// Minimum lease reaper interval (milliseconds)
pub const MIN_LEASE_REAP_INTERVAL_MS: u64 = 10;

/// Maximum lease reaper interval (milliseconds)
pub const MAX_LEASE_REAP_INTERVAL_MS: u64 = 60_000;

// ===== Rebalance =====

/// Default debounce window for coalescing membership changes (milliseconds)
pub const DEFAULT_REBALANCE_DEBOUNCE_MS: u64 = 200;

/// Minimum debounce window (milliseconds)
pub const MIN_REBALANCE_DEBOUNCE_MS: u64 = 0;

/// Maximum debounce window (milliseconds)
pub const MAX_REBALANCE_DEBOUNCE_MS: u64 = 30_000;

/// Default number of retries for a rebalance round that hit a conflict
pub const DEFAULT_REBALANCE_MAX_RETRIES: u32 = 5;

/// Minimum rebalance retries
pub const MIN_REBALANCE_MAX_RETRIES: u32 = 0;

/// Maximum rebalance retries
pub const MAX_REBALANCE_MAX_RETRIES: u32 = 100;

/// Default base backoff between rebalance retries (milliseconds)
pub const DEFAULT_REBALANCE_RETRY_BACKOFF_MS: u64 = 100;

/// Minimum rebalance backoff (milliseconds)
pub const MIN_REBALANCE_RETRY_BACKOFF_MS: u64 = 1;

/// Maximum rebalance backoff (milliseconds)
pub const MAX_REBALANCE_RETRY_BACKOFF_MS: u64 = 60_000;

// ===== Listing =====

/// Default page size for subscription listing
pub const DEFAULT_LIST_LIMIT: usize = 20;

/// Largest page size a caller may request
pub const DEFAULT_LIST_MAX_LIMIT: usize = 1_000;

/// Minimum page size
pub const MIN_LIST_LIMIT: usize = 1;

/// Hard upper bound for the configurable page size
pub const MAX_LIST_LIMIT: usize = 10_000;

// ===== Streaming =====

/// Default number of events per streamed batch
pub const DEFAULT_STREAM_BATCH_SIZE: usize = 1;

/// Minimum events per batch
pub const MIN_STREAM_BATCH_SIZE: usize = 1;

/// Maximum events per batch
pub const MAX_STREAM_BATCH_SIZE: usize = 10_000;

/// Default wait between empty pulls when no notification arrives (milliseconds)
pub const DEFAULT_STREAM_POLL_INTERVAL_MS: u64 = 100;

/// Minimum stream poll interval (milliseconds)
pub const MIN_STREAM_POLL_INTERVAL_MS: u64 = 1;

/// Maximum stream poll interval (milliseconds)
pub const MAX_STREAM_POLL_INTERVAL_MS: u64 = 10_000;

// ===== Offsets =====

/// Width of the zero-padded decimal offset representation
///
/// Fixed width keeps lexical order of stored offsets equal to numeric order.
pub const OFFSET_WIDTH: usize = 18;

/// Wire value of the position before the first event of a partition
pub const OFFSET_BEGIN: &str = "BEGIN";

// ===== Coordination Store Layout =====

/// Root node holding one child per subscription
pub const SUBSCRIPTIONS_ROOT: &str = "/subscriptions";

/// Root node of the content-addressed deduplication index
pub const SUBSCRIPTION_KEYS_ROOT: &str = "/subscription_keys";

/// Child of a subscription holding one ephemeral node per live session
pub const SESSIONS_NODE: &str = "sessions";

/// Child of a subscription holding per-partition state
pub const TOPICS_NODE: &str = "topics";

/// Child of a subscription whose version guards assignment updates
pub const TOPOLOGY_NODE: &str = "topology";

/// Per-partition node holding the committed offset
pub const OFFSET_NODE: &str = "offset";

/// Per-partition node holding the owning session id
pub const SESSION_NODE: &str = "session";

// ===== Environment =====

/// Prefix of environment variables read by `Config::load()`
pub const ENV_PREFIX: &str = "SUBSCRIPTION_COORDINATOR_";
