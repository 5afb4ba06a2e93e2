//! Run work while holding a lock

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;

use super::model::{LockHandle, LockOptions};
use super::service::LockCoordinator;
use crate::error::{RedlockError, Result};

impl LockCoordinator {
    /// Acquire `resource`, run `work`, then release the lock.
    ///
    /// The lock is released on every exit path of `work`, including a panic,
    /// which is resumed after the release. Returns `Ok(None)` without running
    /// `work` when the lock could not be obtained.
    pub async fn run_locked<F, Fut, T>(
        &self,
        resource: &str,
        ttl_ms: u64,
        options: LockOptions,
        work: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(handle) = self.lock(resource, ttl_ms, options).await? else {
            return Ok(None);
        };

        let held = handle.clone();
        let outcome = AssertUnwindSafe(async move { work(held).await })
            .catch_unwind()
            .await;
        self.unlock(&handle).await;

        match outcome {
            Ok(value) => Ok(Some(value)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Like [`run_locked`](Self::run_locked) but failing to obtain the lock is
    /// an error instead of a skipped block.
    pub async fn run_locked_or_fail<F, Fut, T>(
        &self,
        resource: &str,
        ttl_ms: u64,
        options: LockOptions,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        self.run_locked(resource, ttl_ms, options, work)
            .await?
            .ok_or_else(|| RedlockError::NotAcquired {
                resource: resource.to_string(),
            })
    }
}
