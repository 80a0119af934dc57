//! Engine configuration.

use std::time::Duration;

/// Tunables for [`PlacementEngine`](crate::engine::PlacementEngine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum time between two successful placements by one identity.
    pub cooldown: Duration,
    /// Upper bound on waiting for an identity's atomic unit.
    pub lock_timeout: Duration,
    /// How long store failures are retried before reporting `Unavailable`.
    pub store_grace: Duration,
    /// Pause between store retries.
    pub store_retry_backoff: Duration,
    /// Number of change records kept in the feed.
    pub feed_retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(5_000),
            lock_timeout: Duration::from_millis(500),
            store_grace: Duration::from_secs(2),
            store_retry_backoff: Duration::from_millis(50),
            feed_retention: 10_000,
        }
    }
}

impl EngineConfig {
    /// Short timeouts and a small feed, for tests.
    pub fn for_testing() -> Self {
        Self {
            cooldown: Duration::from_millis(5_000),
            lock_timeout: Duration::from_millis(200),
            store_grace: Duration::from_millis(100),
            store_retry_backoff: Duration::from_millis(10),
            feed_retention: 64,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_feed_retention(mut self, retention: usize) -> Self {
        self.feed_retention = retention.max(1);
        self
    }
}
