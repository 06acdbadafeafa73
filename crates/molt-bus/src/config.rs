//! Bus configuration.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::BusError;

/// Bounded retry with exponential backoff for broken-pipe class failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total transmission attempts per work item, including the first.
    pub max_attempts: u32,
    /// Delay before the first requeue.
    pub initial_backoff: Duration,
    /// Upper bound for the delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Returns true if an item that has made `attempts` attempts may be retried.
    #[must_use]
    pub const fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before retrying after `attempts` failed attempts.
    ///
    /// Doubles per attempt up to `max_backoff`, with up to 25% jitter.
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        let jitter_ceiling = u64::try_from(base.as_millis() / 4).unwrap_or(u64::MAX);
        if jitter_ceiling == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
        base.saturating_add(Duration::from_millis(jitter))
            .min(self.max_backoff)
    }
}

/// Configuration for a message bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Capacity of the outbound queue; senders block when it is full.
    pub queue_capacity: usize,
    /// Longest inbound frame accepted, in bytes.
    pub max_frame_len: usize,
    /// A stream write stalled for longer is treated as a closed connection.
    pub write_timeout: Duration,
    /// Opening a stream that takes longer fails without retry.
    pub connect_timeout: Duration,
    /// Retry policy for closed connections.
    pub retry: RetryPolicy,
    /// Maximum events tracked by the acknowledged multicast store.
    pub event_store_capacity: usize,
    /// How long an event stays in the acknowledged multicast store.
    pub event_store_ttl: Duration,
    /// Maximum ids remembered by the flood gossip handled-set.
    pub seen_cache_capacity: usize,
    /// How long a handled id is remembered.
    pub seen_cache_ttl: Duration,
    /// Reject unsigned messages when a verifier is configured.
    pub require_signatures: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            max_frame_len: 4 * 1024 * 1024,
            write_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            event_store_capacity: 10_000,
            event_store_ttl: Duration::from_secs(3600),
            seen_cache_capacity: 10_000,
            seen_cache_ttl: Duration::from_secs(300),
            require_signatures: false,
        }
    }
}

impl BusConfig {
    /// Creates a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the outbound queue capacity.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the maximum inbound frame length.
    #[must_use]
    pub const fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Sets the write timeout.
    #[must_use]
    pub const fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the stream open timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the acknowledged multicast store bounds.
    #[must_use]
    pub const fn with_event_store(mut self, capacity: usize, ttl: Duration) -> Self {
        self.event_store_capacity = capacity;
        self.event_store_ttl = ttl;
        self
    }

    /// Sets the flood gossip handled-set bounds.
    #[must_use]
    pub const fn with_seen_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.seen_cache_capacity = capacity;
        self.seen_cache_ttl = ttl;
        self
    }

    /// Requires every inbound message to carry a valid signature.
    #[must_use]
    pub const fn with_required_signatures(mut self, required: bool) -> Self {
        self.require_signatures = required;
        self
    }

    /// Checks the configuration for values the bus cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.queue_capacity == 0 {
            return Err(BusError::Config("queue_capacity must be positive".into()));
        }
        if self.max_frame_len == 0 {
            return Err(BusError::Config("max_frame_len must be positive".into()));
        }
        if self.write_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(BusError::Config("timeouts must be positive".into()));
        }
        if self.event_store_capacity == 0 || self.seen_cache_capacity == 0 {
            return Err(BusError::Config("cache capacities must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(BusError::Config("retry.max_attempts must be positive".into()));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(BusError::Config(
                "retry.initial_backoff exceeds retry.max_backoff".into(),
            ));
        }
        Ok(())
    }
}
