//! Lock handle and request options

use serde::{Deserialize, Serialize};

use super::config::RetryDelay;

/// Proof of a successful acquisition or extension.
///
/// `value` is the fencing token written to every store. `validity_ms` is a
/// conservative estimate, taken when the handle was created, of how long the
/// holder may assume exclusive ownership; it is never updated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHandle {
    pub resource: String,
    pub value: String,
    pub validity_ms: u64,
}

impl LockHandle {
    /// Fresh random token for a new acquisition
    pub fn new_token() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Per-call options for `LockCoordinator::lock`
#[derive(Debug, Clone, Default)]
pub struct LockOptions {
    /// Extend this lock instead of acquiring a fresh one. The token is reused.
    pub extend: Option<LockHandle>,
    /// Fail the extension if the resource is not currently held with the token
    pub extend_only_if_locked: bool,
    /// Overrides `CoordinatorConfig::retry_count`
    pub retry_count: Option<u32>,
    /// Overrides `CoordinatorConfig::retry_delay`
    pub retry_delay: Option<RetryDelay>,
    /// Overrides `CoordinatorConfig::retry_jitter_ms`
    pub retry_jitter_ms: Option<u64>,
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend `handle`, creating the lock again under the same token if it is gone
    pub fn extend(handle: LockHandle) -> Self {
        Self {
            extend: Some(handle),
            ..Default::default()
        }
    }

    /// Only extend a lock that is still held
    pub fn only_if_locked(mut self) -> Self {
        self.extend_only_if_locked = true;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn with_retry_jitter(mut self, jitter_ms: u64) -> Self {
        self.retry_jitter_ms = Some(jitter_ms);
        self
    }

    pub(crate) fn allow_new(&self) -> bool {
        !self.extend_only_if_locked
    }
}
