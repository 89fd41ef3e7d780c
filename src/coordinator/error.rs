//! Coordinator error types
//!
//! Two layers of errors exist:
//!
//! - [`StoreError`] is raised by `CoordinationStore` implementations and
//!   describes what went wrong at the coordination-store boundary.
//! - [`CoordinatorError`] is what the services return to their callers. It
//!   carries enough information for the transport layer to pick a status
//!   via [`CoordinatorError::status_code`].
//!
//! Per-item commit outcomes (`OUTDATED`, session mismatch) are values, not
//! errors; see `cursors::CommitResult`.

use thiserror::Error;

/// Errors raised by a coordination store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Create on a path that already exists
    #[error("Node already exists: {0}")]
    NodeExists(String),

    /// Read/update/delete on a path that does not exist
    #[error("Node does not exist: {0}")]
    NoNode(String),

    /// Optimistic concurrency check failed
    #[error("Version mismatch on {path}: expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// Non-recursive delete of a node that still has children
    #[error("Node has children: {0}")]
    NotEmpty(String),

    /// Lease was revoked or expired before the operation
    #[error("Lease {0} expired")]
    LeaseExpired(u64),

    /// Store cannot be reached or timed out
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// True for failures caused by a concurrent writer
    ///
    /// A caller performing read-modify-write treats these as "re-read and
    /// try again" rather than as a hard failure.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::NodeExists(_) | StoreError::NoNode(_) | StoreError::BadVersion { .. }
        )
    }
}

/// Errors returned by the subscription coordinator services
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Request is malformed and will not succeed without changes
    #[error("Validation error: {0}")]
    Validation(String),

    /// Subscription would cover more partitions than allowed
    #[error("total partition count for subscription is {actual}, but the maximum partition count is {max}")]
    PartitionLimitExceeded { actual: u32, max: u32 },

    /// Subscription id is unknown
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Event type referenced by a request does not exist in the log
    #[error("Event type not found: {0}")]
    UnknownEventType(String),

    /// Operation blocked by existing references
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Coordination store is not reachable; safe to retry with backoff
    #[error("Service unavailable: {0}")]
    StoreUnavailable(String),

    /// Any other coordination store failure
    #[error("Coordination store error: {0}")]
    Store(StoreError),

    /// Payload stored in the coordination store could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invariant violation inside the coordinator
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => CoordinatorError::StoreUnavailable(msg),
            other => CoordinatorError::Store(other),
        }
    }
}

impl CoordinatorError {
    /// Status code the transport layer should answer with
    ///
    /// Mirrors the response distinctions of the REST surface: 422 for
    /// requests that cannot succeed as sent, 404 for unknown resources, 409
    /// for blocked deletes and 503 for transient store outages.
    pub fn status_code(&self) -> u16 {
        match self {
            CoordinatorError::Validation(_)
            | CoordinatorError::PartitionLimitExceeded { .. }
            | CoordinatorError::UnknownEventType(_) => 422,
            CoordinatorError::SubscriptionNotFound(_) => 404,
            CoordinatorError::Conflict(_) => 409,
            CoordinatorError::StoreUnavailable(_) => 503,
            CoordinatorError::Store(_)
            | CoordinatorError::Serialization(_)
            | CoordinatorError::Internal(_) => 500,
        }
    }

    /// Whether the same request may succeed when retried unchanged
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinatorError::StoreUnavailable(_) => true,
            CoordinatorError::Store(e) => e.is_conflict(),
            _ => false,
        }
    }
}

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
