//! Coordinator configuration and retry policy

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 200;
pub const DEFAULT_RETRY_JITTER_MS: u64 = 50;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 100;

/// Largest TTL a store can express (Redis `PX` takes a signed 64-bit value)
pub const MAX_TTL_MS: u64 = i64::MAX as u64;

/// Fraction of the TTL reserved for clock drift between stores
pub const CLOCK_DRIFT_FACTOR: f64 = 0.01;
/// Added to the drift to cover TTL precision on the store
pub const MIN_DRIFT_MS: u64 = 2;

/// Base delay before a retry, before jitter is added
#[derive(Clone)]
pub enum RetryDelay {
    Fixed(u64),
    /// Delay computed from the attempt number (1 for the first retry)
    PerAttempt(Arc<dyn Fn(u32) -> u64 + Send + Sync>),
}

impl RetryDelay {
    pub fn per_attempt(f: impl Fn(u32) -> u64 + Send + Sync + 'static) -> Self {
        RetryDelay::PerAttempt(Arc::new(f))
    }

    pub fn base_ms(&self, attempt: u32) -> u64 {
        match self {
            RetryDelay::Fixed(ms) => *ms,
            RetryDelay::PerAttempt(f) => f(attempt),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Fixed(DEFAULT_RETRY_DELAY_MS)
    }
}

impl Debug for RetryDelay {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryDelay::Fixed(ms) => write!(f, "RetryDelay::Fixed({}ms)", ms),
            RetryDelay::PerAttempt(_) => write!(f, "RetryDelay::PerAttempt(..)"),
        }
    }
}

/// Configuration for the lock coordinator
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Retries after the first attempt of a fresh acquisition
    pub retry_count: u32,
    /// Base delay between attempts
    pub retry_delay: RetryDelay,
    /// Upper bound of the random delay added to each retry
    pub retry_jitter_ms: u64,
    /// Bound on every single store call
    pub store_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: RetryDelay::default(),
            retry_jitter_ms: DEFAULT_RETRY_JITTER_MS,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_retry_jitter(mut self, jitter_ms: u64) -> Self {
        self.retry_jitter_ms = jitter_ms;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }
}

/// Sleep before retry number `attempt`: base delay plus `0..=jitter_ms`
pub(crate) fn retry_sleep(delay: &RetryDelay, jitter_ms: u64, attempt: u32) -> Duration {
    let jitter = if jitter_ms > 0 {
        rand::rng().random_range(0..=jitter_ms)
    } else {
        0
    };
    Duration::from_millis(delay.base_ms(attempt).saturating_add(jitter))
}

/// Validity reserved for drift: 1% of the TTL plus a 2ms floor
pub fn drift_ms(ttl_ms: u64) -> u64 {
    (ttl_ms as f64 * CLOCK_DRIFT_FACTOR) as u64 + MIN_DRIFT_MS
}

/// Smallest strict majority of `stores`
pub fn quorum_for(stores: usize) -> usize {
    stores / 2 + 1
}
