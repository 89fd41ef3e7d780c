//! Mock implementations of the store and log seams
//!
//! Lets services be tested against scripted failures the in-memory
//! implementations cannot produce on demand.

use std::time::Duration;

use mockall::mock;

use crate::config::Config;
use crate::coordinator::broker::{EventLog, LogEvent, PartitionStatistics};
use crate::coordinator::coordination::{
    CoordinationStore, CreateMode, LeaseId, Node, Op, StoreResult, Watcher,
};
use crate::coordinator::error::Result;
use crate::coordinator::model::Offset;

mock! {
    pub CoordinationStore {}

    impl CoordinationStore for CoordinationStore {
        fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<()>;
        fn get(&self, path: &str) -> StoreResult<Option<Node>>;
        fn set(&self, path: &str, data: &[u8], expected_version: Option<u64>) -> StoreResult<u64>;
        fn delete(&self, path: &str, expected_version: Option<u64>) -> StoreResult<()>;
        fn delete_recursive(&self, path: &str) -> StoreResult<()>;
        fn children(&self, path: &str) -> StoreResult<Vec<String>>;
        fn multi(&self, ops: &[Op]) -> StoreResult<()>;
        fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId>;
        fn keep_alive(&self, lease: LeaseId) -> StoreResult<()>;
        fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()>;
        fn watch(&self, prefix: &str) -> StoreResult<Watcher>;
    }
}

mock! {
    pub EventLog {}

    impl EventLog for EventLog {
        fn event_type_exists(&self, event_type: &str) -> Result<bool>;
        fn partition_count(&self, event_type: &str) -> Result<u32>;
        fn partition_statistics(&self, event_type: &str) -> Result<Vec<PartitionStatistics>>;
        fn earliest_offset(&self, event_type: &str, partition: u32) -> Result<Offset>;
        fn latest_offset(&self, event_type: &str, partition: u32) -> Result<Offset>;
        fn fetch(
            &self,
            event_type: &str,
            partition: u32,
            after: Offset,
            max: usize,
        ) -> Result<Vec<LogEvent>>;
        fn delete_event_type(&self, event_type: &str) -> Result<()>;
    }
}

/// Config with timings short enough for paused-clock tests
pub fn fast_config() -> Config {
    Config {
        session_timeout_ms: 300,
        heartbeat_interval_ms: 100,
        lease_reap_interval_ms: 20,
        rebalance_debounce_ms: 10,
        rebalance_retry_backoff_ms: 5,
        stream_poll_interval_ms: 20,
        ..Config::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_config_is_consistent() {
        let config = fast_config();
        assert!(config.heartbeat_interval_ms < config.session_timeout_ms);
        assert!(config.lease_reap_interval_ms < config.session_timeout_ms);
        assert_eq!(config.max_partitions, Config::default().max_partitions);
    }
}
