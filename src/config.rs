// Configuration module for the subscription coordinator
//
// Settings are read from environment variables prefixed with
// SUBSCRIPTION_COORDINATOR_ (e.g. SUBSCRIPTION_COORDINATOR_MAX_PARTITIONS).
// Every numeric setting has a DEFAULT_/MIN_/MAX_ triple in constants.rs;
// values outside the range are clamped and unparsable values fall back to
// the default, both with a warning.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::coordinator::constants::{
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_LEASE_REAP_INTERVAL_MS, DEFAULT_LIST_LIMIT,
    DEFAULT_LIST_MAX_LIMIT, DEFAULT_MAX_PARTITIONS, DEFAULT_REBALANCE_DEBOUNCE_MS,
    DEFAULT_REBALANCE_MAX_RETRIES, DEFAULT_REBALANCE_RETRY_BACKOFF_MS,
    DEFAULT_SESSION_TIMEOUT_MS, DEFAULT_STREAM_BATCH_SIZE, DEFAULT_STREAM_POLL_INTERVAL_MS,
    ENV_PREFIX, MAX_HEARTBEAT_INTERVAL_MS, MAX_LEASE_REAP_INTERVAL_MS, MAX_LIST_LIMIT,
    MAX_MAX_PARTITIONS, MAX_REBALANCE_DEBOUNCE_MS, MAX_REBALANCE_MAX_RETRIES,
    MAX_REBALANCE_RETRY_BACKOFF_MS, MAX_SESSION_TIMEOUT_MS, MAX_STREAM_BATCH_SIZE,
    MAX_STREAM_POLL_INTERVAL_MS, MIN_HEARTBEAT_INTERVAL_MS, MIN_LEASE_REAP_INTERVAL_MS,
    MIN_LIST_LIMIT, MIN_MAX_PARTITIONS, MIN_REBALANCE_DEBOUNCE_MS, MIN_REBALANCE_MAX_RETRIES,
    MIN_REBALANCE_RETRY_BACKOFF_MS, MIN_SESSION_TIMEOUT_MS, MIN_STREAM_BATCH_SIZE,
    MIN_STREAM_POLL_INTERVAL_MS,
};

/// Configuration struct holding all coordinator settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum total partitions across the event types of a subscription
    pub max_partitions: u32,
    /// Lease timeout of a streaming session (milliseconds)
    pub session_timeout_ms: u64,
    /// Lease renewal interval (milliseconds)
    pub heartbeat_interval_ms: u64,
    /// Background lease reaper interval (milliseconds)
    pub lease_reap_interval_ms: u64,
    /// Window in which membership changes are coalesced into one rebalance
    pub rebalance_debounce_ms: u64,
    /// Retries of a rebalance round after a conflict or store failure
    pub rebalance_max_retries: u32,
    /// Base backoff between rebalance retries (milliseconds)
    pub rebalance_retry_backoff_ms: u64,
    /// Page size used when a list request does not specify one
    pub list_default_limit: usize,
    /// Largest page size a list request may ask for
    pub list_max_limit: usize,
    /// Maximum events per streamed batch
    pub stream_batch_size: usize,
    /// Wait between pulls when no events are available (milliseconds)
    pub stream_poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_partitions: DEFAULT_MAX_PARTITIONS,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            lease_reap_interval_ms: DEFAULT_LEASE_REAP_INTERVAL_MS,
            rebalance_debounce_ms: DEFAULT_REBALANCE_DEBOUNCE_MS,
            rebalance_max_retries: DEFAULT_REBALANCE_MAX_RETRIES,
            rebalance_retry_backoff_ms: DEFAULT_REBALANCE_RETRY_BACKOFF_MS,
            list_default_limit: DEFAULT_LIST_LIMIT,
            list_max_limit: DEFAULT_LIST_MAX_LIMIT,
            stream_batch_size: DEFAULT_STREAM_BATCH_SIZE,
            stream_poll_interval_ms: DEFAULT_STREAM_POLL_INTERVAL_MS,
        }
    }
}

impl Config {
    /// Load configuration from the process environment
    pub fn load() -> Self {
        Self::load_from(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    ///
    /// # Arguments
    /// * `lookup` - returns the raw value for a fully prefixed variable name
    pub fn load_from<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config {
            max_partitions: setting(
                &lookup,
                "MAX_PARTITIONS",
                DEFAULT_MAX_PARTITIONS,
                MIN_MAX_PARTITIONS,
                MAX_MAX_PARTITIONS,
            ),
            session_timeout_ms: setting(
                &lookup,
                "SESSION_TIMEOUT_MS",
                DEFAULT_SESSION_TIMEOUT_MS,
                MIN_SESSION_TIMEOUT_MS,
                MAX_SESSION_TIMEOUT_MS,
            ),
            heartbeat_interval_ms: setting(
                &lookup,
                "HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
                MIN_HEARTBEAT_INTERVAL_MS,
                MAX_HEARTBEAT_INTERVAL_MS,
            ),
            lease_reap_interval_ms: setting(
                &lookup,
                "LEASE_REAP_INTERVAL_MS",
                DEFAULT_LEASE_REAP_INTERVAL_MS,
                MIN_LEASE_REAP_INTERVAL_MS,
                MAX_LEASE_REAP_INTERVAL_MS,
            ),
            rebalance_debounce_ms: setting(
                &lookup,
                "REBALANCE_DEBOUNCE_MS",
                DEFAULT_REBALANCE_DEBOUNCE_MS,
                MIN_REBALANCE_DEBOUNCE_MS,
                MAX_REBALANCE_DEBOUNCE_MS,
            ),
            rebalance_max_retries: setting(
                &lookup,
                "REBALANCE_MAX_RETRIES",
                DEFAULT_REBALANCE_MAX_RETRIES,
                MIN_REBALANCE_MAX_RETRIES,
                MAX_REBALANCE_MAX_RETRIES,
            ),
            rebalance_retry_backoff_ms: setting(
                &lookup,
                "REBALANCE_RETRY_BACKOFF_MS",
                DEFAULT_REBALANCE_RETRY_BACKOFF_MS,
                MIN_REBALANCE_RETRY_BACKOFF_MS,
                MAX_REBALANCE_RETRY_BACKOFF_MS,
            ),
            list_default_limit: setting(
                &lookup,
                "LIST_DEFAULT_LIMIT",
                DEFAULT_LIST_LIMIT,
                MIN_LIST_LIMIT,
                MAX_LIST_LIMIT,
            ),
            list_max_limit: setting(
                &lookup,
                "LIST_MAX_LIMIT",
                DEFAULT_LIST_MAX_LIMIT,
                MIN_LIST_LIMIT,
                MAX_LIST_LIMIT,
            ),
            stream_batch_size: setting(
                &lookup,
                "STREAM_BATCH_SIZE",
                DEFAULT_STREAM_BATCH_SIZE,
                MIN_STREAM_BATCH_SIZE,
                MAX_STREAM_BATCH_SIZE,
            ),
            stream_poll_interval_ms: setting(
                &lookup,
                "STREAM_POLL_INTERVAL_MS",
                DEFAULT_STREAM_POLL_INTERVAL_MS,
                MIN_STREAM_POLL_INTERVAL_MS,
                MAX_STREAM_POLL_INTERVAL_MS,
            ),
        };

        // Cross-field constraints
        if config.heartbeat_interval_ms >= config.session_timeout_ms {
            let adjusted = (config.session_timeout_ms / 3).max(MIN_HEARTBEAT_INTERVAL_MS);
            warn!(
                "heartbeat_interval_ms={} must be below session_timeout_ms={}, using {}",
                config.heartbeat_interval_ms, config.session_timeout_ms, adjusted
            );
            config.heartbeat_interval_ms = adjusted;
        }
        if config.list_default_limit > config.list_max_limit {
            warn!(
                "list_default_limit={} exceeds list_max_limit={}, using the maximum",
                config.list_default_limit, config.list_max_limit
            );
            config.list_default_limit = config.list_max_limit;
        }

        config
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn lease_reap_interval(&self) -> Duration {
        Duration::from_millis(self.lease_reap_interval_ms)
    }

    pub fn rebalance_debounce(&self) -> Duration {
        Duration::from_millis(self.rebalance_debounce_ms)
    }

    pub fn rebalance_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.rebalance_retry_backoff_ms)
    }

    pub fn stream_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stream_poll_interval_ms)
    }
}

/// Read one setting, falling back to `default` and clamping to `[min, max]`
fn setting<T, F>(lookup: &F, name: &str, default: T, min: T, max: T) -> T
where
    T: FromStr + PartialOrd + Copy + Display,
    F: Fn(&str) -> Option<String>,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    let Some(raw) = lookup(&key) else {
        return default;
    };

    match raw.trim().parse::<T>() {
        Ok(value) if value < min => {
            warn!("{}={} is below minimum {}, clamping", key, value, min);
            min
        }
        Ok(value) if value > max => {
            warn!("{}={} exceeds maximum {}, clamping", key, value, max);
            max
        }
        Ok(value) => value,
        Err(_) => {
            warn!("{}='{}' is not a valid value, using default {}", key, raw, default);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("{}{}", ENV_PREFIX, k), v.to_string()))
            .collect();
        Config::load_from(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_environment() {
        assert_eq!(load(&[]), Config::default());
        assert_eq!(Config::default().max_partitions, 30);
    }

    #[test]
    fn test_values_are_read() {
        let config = load(&[("MAX_PARTITIONS", "12"), ("SESSION_TIMEOUT_MS", "9000")]);
        assert_eq!(config.max_partitions, 12);
        assert_eq!(config.session_timeout(), Duration::from_millis(9000));
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let config = load(&[("MAX_PARTITIONS", "0"), ("STREAM_BATCH_SIZE", "99999999")]);
        assert_eq!(config.max_partitions, MIN_MAX_PARTITIONS);
        assert_eq!(config.stream_batch_size, MAX_STREAM_BATCH_SIZE);
    }

    #[test]
    fn test_garbage_falls_back_to_default() {
        let config = load(&[("REBALANCE_MAX_RETRIES", "lots"), ("LIST_MAX_LIMIT", "-3")]);
        assert_eq!(config.rebalance_max_retries, DEFAULT_REBALANCE_MAX_RETRIES);
        assert_eq!(config.list_max_limit, DEFAULT_LIST_MAX_LIMIT);
    }

    #[test]
    fn test_heartbeat_kept_below_session_timeout() {
        let config = load(&[
            ("SESSION_TIMEOUT_MS", "3000"),
            ("HEARTBEAT_INTERVAL_MS", "5000"),
        ]);
        assert_eq!(config.heartbeat_interval_ms, 1000);
    }

    #[test]
    fn test_default_limit_capped_by_max_limit() {
        let config = load(&[("LIST_DEFAULT_LIMIT", "500"), ("LIST_MAX_LIMIT", "100")]);
        assert_eq!(config.list_default_limit, 100);
    }
}
