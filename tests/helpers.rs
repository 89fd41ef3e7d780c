// Test helpers for subscription coordinator integration tests
//
// A `Harness` wires a `SubscriptionService` over an in-memory store and log
// with timings short enough for paused-clock tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use subscription_coordinator::coordinator::{
    CoordinationStore, MemoryEventLog, MemoryStore, RuntimeContext, StreamBatch, Subscription,
    SubscriptionDefinition, SubscriptionService, SubscriptionStream,
};
use subscription_coordinator::Config;

/// Config with sub-second timings
pub fn test_config() -> Config {
    Config {
        session_timeout_ms: 300,
        heartbeat_interval_ms: 100,
        lease_reap_interval_ms: 20,
        rebalance_debounce_ms: 10,
        rebalance_retry_backoff_ms: 5,
        stream_batch_size: 10,
        stream_poll_interval_ms: 20,
        ..Config::default()
    }
}

pub struct Harness {
    pub context: Arc<RuntimeContext>,
    pub store: Arc<MemoryStore>,
    pub log: Arc<MemoryEventLog>,
    pub service: SubscriptionService,
}

impl Harness {
    /// Service over fresh backends holding the given event types
    ///
    /// Must be created inside a tokio runtime.
    pub fn new(event_types: &[(&str, u32)]) -> Self {
        Self::with_config(event_types, test_config())
    }

    pub fn with_config(event_types: &[(&str, u32)], config: Config) -> Self {
        let context = Arc::new(RuntimeContext::new(config));
        let store = Arc::new(MemoryStore::new());
        let log = Arc::new(MemoryEventLog::new());
        for (name, partitions) in event_types {
            log.create_event_type(name, *partitions).unwrap();
        }
        let service = SubscriptionService::in_memory(context.clone(), store.clone(), log.clone());
        Self {
            context,
            store,
            log,
            service,
        }
    }

    /// Second service instance over the same backends, as another process would be
    pub fn peer(&self) -> SubscriptionService {
        let store: Arc<dyn CoordinationStore> = self.store.clone();
        SubscriptionService::new(self.context.clone(), store, self.log.clone())
    }

    pub async fn subscribe(&self, def: SubscriptionDefinition) -> Subscription {
        self.service
            .create_subscription(&def)
            .await
            .unwrap()
            .into_subscription()
    }

    /// Publish `count` events to one partition
    pub fn publish(&self, event_type: &str, partition: u32, count: usize) {
        for n in 0..count {
            self.log
                .publish(event_type, partition, json!({ "n": n }))
                .unwrap();
        }
    }
}

/// Let debounced rebalances, renewals and the reaper run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

/// Next batch of a stream, failing the test if none arrives in time
pub async fn next_batch(stream: &mut SubscriptionStream) -> StreamBatch {
    tokio::time::timeout(Duration::from_secs(5), stream.next_batch())
        .await
        .expect("no batch within timeout")
        .unwrap()
        .expect("stream ended")
}
