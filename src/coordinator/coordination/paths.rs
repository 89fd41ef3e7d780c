//! Coordination store path layout
//!
//! ```text
//! /subscriptions/{id}                                   subscription definition (JSON)
//! /subscriptions/{id}/sessions/{session_id}             ephemeral liveness node
//! /subscriptions/{id}/topology                          assignment generation
//! /subscriptions/{id}/topics/{event_type}/{p}/offset    committed offset
//! /subscriptions/{id}/topics/{event_type}/{p}/session   owning session id
//! /subscription_keys/{key}                              dedup index -> subscription id
//! ```

use crate::coordinator::constants::{
    OFFSET_NODE, SESSIONS_NODE, SESSION_NODE, SUBSCRIPTIONS_ROOT, SUBSCRIPTION_KEYS_ROOT,
    TOPICS_NODE, TOPOLOGY_NODE,
};
use crate::coordinator::model::EventTypePartition;

pub fn subscription(id: &str) -> String {
    format!("{}/{}", SUBSCRIPTIONS_ROOT, id)
}

pub fn sessions(subscription_id: &str) -> String {
    format!("{}/{}", subscription(subscription_id), SESSIONS_NODE)
}

pub fn session(subscription_id: &str, session_id: &str) -> String {
    format!("{}/{}", sessions(subscription_id), session_id)
}

pub fn topology(subscription_id: &str) -> String {
    format!("{}/{}", subscription(subscription_id), TOPOLOGY_NODE)
}

pub fn topics(subscription_id: &str) -> String {
    format!("{}/{}", subscription(subscription_id), TOPICS_NODE)
}

pub fn event_type(subscription_id: &str, event_type: &str) -> String {
    format!("{}/{}", topics(subscription_id), event_type)
}

pub fn partition(subscription_id: &str, key: &EventTypePartition) -> String {
    format!(
        "{}/{}",
        event_type(subscription_id, &key.event_type),
        key.partition
    )
}

pub fn partition_offset(subscription_id: &str, key: &EventTypePartition) -> String {
    format!("{}/{}", partition(subscription_id, key), OFFSET_NODE)
}

pub fn partition_session(subscription_id: &str, key: &EventTypePartition) -> String {
    format!("{}/{}", partition(subscription_id, key), SESSION_NODE)
}

pub fn subscription_key(key: &str) -> String {
    format!("{}/{}", SUBSCRIPTION_KEYS_ROOT, key)
}

/// Parent of a path, None for the root or a top-level node's parent
pub fn parent(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        None
    } else {
        Some(&path[..idx])
    }
}

/// Last segment of a path
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// True if `path` equals `prefix` or lies in its subtree
pub fn is_within(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix
        || (path.len() > prefix.len()
            && path.starts_with(prefix)
            && path.as_bytes()[prefix.len()] == b'/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_paths() {
        let key = EventTypePartition::new("order.created", 3);
        assert_eq!(
            partition_offset("sub-1", &key),
            "/subscriptions/sub-1/topics/order.created/3/offset"
        );
        assert_eq!(
            partition_session("sub-1", &key),
            "/subscriptions/sub-1/topics/order.created/3/session"
        );
        assert_eq!(session("sub-1", "s"), "/subscriptions/sub-1/sessions/s");
        assert_eq!(topology("sub-1"), "/subscriptions/sub-1/topology");
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent("/a/b/c"), Some("/a/b"));
        assert_eq!(parent("/a"), None);
        assert_eq!(name("/a/b/c"), "c");
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/subscriptions/a", "/subscriptions/a"));
        assert!(is_within("/subscriptions/a/sessions/x", "/subscriptions/a"));
        assert!(!is_within("/subscriptions/ab", "/subscriptions/a"));
        assert!(is_within("/anything", "/"));
    }
}
