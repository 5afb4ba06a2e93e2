//! Redquorum Core - Redlock quorum locking
//!
//! This crate provides:
//! - `LockCoordinator`: acquire, extend, release and query locks across N stores
//! - Clock-drift compensated validity and quorum evaluation
//! - Retry with jittered delay and an aggregate error when a majority is unreachable
//! - Scoped execution that always releases the lock
//! - Optional background keep-alive renewal
//! - Cancellation of in-flight acquisitions

pub mod cancel;
pub mod clock;
pub mod error;
pub mod lock;

pub use cancel::CancelSignal;
pub use clock::{ManualClock, MonotonicClock, TimeSource};
pub use error::{RedlockError, Result};
pub use lock::{
    CoordinatorConfig, LockCoordinator, LockHandle, LockOptions, LockRenewal, RetryDelay,
    drift_ms, quorum_for,
};

pub use redquorum_store::{
    DEFAULT_REDIS_URL, MemoryStore, RedisStore, StoreBackend, StoreDescriptor, StoreError,
};
