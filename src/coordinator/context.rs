//! Runtime context for shared configuration
//!
//! Every coordinator service holds an `Arc<RuntimeContext>` and reads the
//! configuration through it, so a reload is picked up by the next operation
//! without restarting background tasks.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::config::Config;

/// Shared, reloadable configuration
///
/// Reads clone an `Arc<Config>` (single pointer copy). Reload swaps the
/// pointer under a brief write lock; callers holding the old `Arc` keep
/// seeing the old values until they call `config()` again.
pub struct RuntimeContext {
    config: RwLock<Arc<Config>>,
}

impl RuntimeContext {
    pub fn new(config: Config) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
        }
    }

    /// Get current config (cheap Arc clone)
    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    /// Reload config from the environment
    pub fn reload(&self) {
        self.replace(Config::load());
    }

    /// Swap in an explicit configuration
    pub fn replace(&self, config: Config) {
        *self.config.write() = Arc::new(config);
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
