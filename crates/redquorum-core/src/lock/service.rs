//! Lock coordinator: the Redlock protocol over N independent stores
//!
//! Acquire/extend:
//! 1. Write `value` with the TTL on every store in parallel, counting successes
//!    and collecting errors per store.
//! 2. `validity = ttl - elapsed - drift(ttl)`.
//! 3. Succeed iff at least `quorum` stores accepted the write and validity is
//!    not negative. Otherwise release the token everywhere and retry.
//! 4. If `quorum` stores failed with errors, stop and report all of them.
//!
//! The coordinator keeps no lock state; every query is answered from the stores.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use redquorum_store::{StoreDescriptor, StoreError, StoreHandle};
use tracing::{debug, info, warn};

use super::config::{CoordinatorConfig, MAX_TTL_MS, drift_ms, quorum_for, retry_sleep};
use super::model::{LockHandle, LockOptions};
use crate::cancel::{CancelListener, CancelSignal};
use crate::clock::{MonotonicClock, TimeSource};
use crate::error::{RedlockError, Result};

/// Value held by a quorum of stores and the pessimistic remaining TTL
#[derive(Debug, Clone, PartialEq, Eq)]
struct AuthoritativeLock {
    value: String,
    ttl_ms: u64,
}

/// Quorum lock manager over a fixed set of stores. Cheap to clone.
#[derive(Clone)]
pub struct LockCoordinator {
    stores: Arc<Vec<StoreHandle>>,
    quorum: usize,
    config: CoordinatorConfig,
    clock: Arc<dyn TimeSource>,
}

impl LockCoordinator {
    /// Build a coordinator. No connection is made until the first operation.
    pub fn new<I, D>(stores: I, config: CoordinatorConfig) -> Result<Self>
    where
        I: IntoIterator<Item = D>,
        D: Into<StoreDescriptor>,
    {
        let handles = stores
            .into_iter()
            .map(|descriptor| -> Result<StoreHandle> {
                let descriptor: StoreDescriptor = descriptor.into();
                let backend = descriptor.into_backend()?;
                Ok(StoreHandle::new(backend, config.store_timeout))
            })
            .collect::<Result<Vec<_>>>()?;

        if handles.is_empty() {
            return Err(RedlockError::Config(
                "at least one store is required".to_string(),
            ));
        }

        let quorum = quorum_for(handles.len());
        info!(
            stores = handles.len(),
            quorum,
            retry_count = config.retry_count,
            "lock coordinator created"
        );

        Ok(Self {
            stores: Arc::new(handles),
            quorum,
            config,
            clock: Arc::new(MonotonicClock::new()),
        })
    }

    /// Replace the clock used to measure attempt duration
    pub fn with_time_source(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn store_count(&self) -> usize {
        self.stores.len()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Load the lock scripts on every store now. Returns how many stores
    /// succeeded; the others load lazily on first use.
    pub async fn preload_scripts(&self) -> usize {
        let results = join_all(self.stores.iter().map(|store| store.preload_scripts())).await;
        let mut loaded = 0;
        for (store, result) in self.stores.iter().zip(results) {
            match result {
                Ok(()) => loaded += 1,
                Err(e) => warn!(store = store.name(), error = %e, "failed to preload scripts"),
            }
        }
        loaded
    }

    /// Acquire `resource` for `ttl_ms`, or extend the lock given in `options`.
    ///
    /// Returns `Ok(None)` if the lock could not be obtained within the attempt
    /// budget and `Err(QuorumUnreachable)` as soon as a quorum of stores fails.
    pub async fn lock(
        &self,
        resource: &str,
        ttl_ms: u64,
        options: LockOptions,
    ) -> Result<Option<LockHandle>> {
        self.try_lock(resource, ttl_ms, options, None).await
    }

    /// Like [`lock`](Self::lock) but a failed acquisition is an error
    pub async fn lock_or_fail(
        &self,
        resource: &str,
        ttl_ms: u64,
        options: LockOptions,
    ) -> Result<LockHandle> {
        self.lock(resource, ttl_ms, options)
            .await?
            .ok_or_else(|| RedlockError::NotAcquired {
                resource: resource.to_string(),
            })
    }

    /// Like [`lock`](Self::lock) but gives up when `cancel` fires, releasing
    /// whatever the interrupted attempt may have written.
    pub async fn lock_with_cancel(
        &self,
        resource: &str,
        ttl_ms: u64,
        options: LockOptions,
        cancel: &CancelSignal,
    ) -> Result<Option<LockHandle>> {
        let mut listener = cancel.subscribe();
        self.try_lock(resource, ttl_ms, options, Some(&mut listener))
            .await
    }

    /// Release the lock on every store. Never fails; stores that cannot be
    /// reached keep the key until it expires.
    pub async fn unlock(&self, handle: &LockHandle) {
        self.release_everywhere(&handle.resource, &handle.value)
            .await;
        debug!(resource = %handle.resource, "lock released");
    }

    /// Remaining milliseconds a quorum of stores will hold `resource`, or
    /// `None` if no value is held by a quorum.
    pub async fn remaining_ttl_for_resource(&self, resource: &str) -> Option<u64> {
        self.authoritative_lock(resource)
            .await
            .map(|lock| lock.ttl_ms)
    }

    /// Remaining milliseconds of `handle`, or `None` if a quorum no longer
    /// holds its token.
    pub async fn remaining_ttl_for_lock(&self, handle: &LockHandle) -> Option<u64> {
        self.authoritative_lock(&handle.resource)
            .await
            .filter(|lock| lock.value == handle.value)
            .map(|lock| lock.ttl_ms)
    }

    pub async fn is_locked(&self, resource: &str) -> bool {
        self.remaining_ttl_for_resource(resource).await.is_some()
    }

    pub async fn is_valid_lock(&self, handle: &LockHandle) -> bool {
        self.remaining_ttl_for_lock(handle).await.is_some()
    }

    async fn try_lock(
        &self,
        resource: &str,
        ttl_ms: u64,
        options: LockOptions,
        mut cancel: Option<&mut CancelListener>,
    ) -> Result<Option<LockHandle>> {
        if ttl_ms > MAX_TTL_MS {
            return Err(RedlockError::Config(format!(
                "ttl of {}ms exceeds the maximum of {}ms",
                ttl_ms, MAX_TTL_MS
            )));
        }
        let allow_new = options.allow_new();
        let value = match &options.extend {
            Some(handle) => handle.value.clone(),
            None => LockHandle::new_token(),
        };
        let attempts = if options.extend.is_some() {
            1
        } else {
            options
                .retry_count
                .unwrap_or(self.config.retry_count)
                .saturating_add(1)
        };
        let delay = options
            .retry_delay
            .as_ref()
            .unwrap_or(&self.config.retry_delay);
        let jitter_ms = options
            .retry_jitter_ms
            .unwrap_or(self.config.retry_jitter_ms);

        for attempt in 0..attempts {
            if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                debug!(resource, "lock acquisition cancelled");
                return Ok(None);
            }

            if attempt > 0 {
                let sleep = retry_sleep(delay, jitter_ms, attempt);
                match cancel.as_deref_mut() {
                    Some(listener) => {
                        tokio::select! {
                            _ = tokio::time::sleep(sleep) => {}
                            _ = listener.cancelled() => {
                                debug!(resource, "lock acquisition cancelled between attempts");
                                return Ok(None);
                            }
                        }
                    }
                    None => tokio::time::sleep(sleep).await,
                }
            }

            let outcome = match cancel.as_deref_mut() {
                Some(listener) => {
                    tokio::select! {
                        outcome = self.lock_stores(resource, &value, ttl_ms, allow_new) => outcome,
                        _ = listener.cancelled() => {
                            debug!(resource, "lock attempt cancelled, releasing partial locks");
                            self.release_everywhere(resource, &value).await;
                            return Ok(None);
                        }
                    }
                }
                None => self.lock_stores(resource, &value, ttl_ms, allow_new).await,
            };

            if let Some(handle) = outcome? {
                debug!(
                    resource,
                    attempt = attempt + 1,
                    validity_ms = handle.validity_ms,
                    "lock acquired"
                );
                return Ok(Some(handle));
            }
        }

        debug!(resource, attempts, "lock not acquired");
        Ok(None)
    }

    /// One attempt across all stores
    async fn lock_stores(
        &self,
        resource: &str,
        value: &str,
        ttl_ms: u64,
        allow_new: bool,
    ) -> Result<Option<LockHandle>> {
        let start = self.clock.now_ms();
        let results = join_all(
            self.stores
                .iter()
                .map(|store| store.acquire_or_extend(resource, value, ttl_ms, allow_new)),
        )
        .await;
        let elapsed = self.clock.now_ms().saturating_sub(start);

        let mut locked = 0;
        let mut errors: Vec<StoreError> = Vec::new();
        for (store, result) in self.stores.iter().zip(results) {
            match result {
                Ok(true) => locked += 1,
                Ok(false) => {}
                Err(e) => {
                    debug!(store = store.name(), resource, error = %e, "store failed during lock");
                    errors.push(e);
                }
            }
        }

        let validity = ttl_ms as i128 - elapsed as i128 - drift_ms(ttl_ms) as i128;

        if errors.len() >= self.quorum {
            warn!(
                resource,
                errors = errors.len(),
                quorum = self.quorum,
                "quorum of stores unreachable"
            );
            self.release_everywhere(resource, value).await;
            return Err(RedlockError::QuorumUnreachable {
                resource: resource.to_string(),
                errors,
            });
        }

        if locked >= self.quorum && validity >= 0 {
            return Ok(Some(LockHandle {
                resource: resource.to_string(),
                value: value.to_string(),
                validity_ms: validity as u64,
            }));
        }

        debug!(
            resource,
            locked,
            quorum = self.quorum,
            validity,
            "lock attempt failed"
        );
        self.release_everywhere(resource, value).await;
        Ok(None)
    }

    async fn release_everywhere(&self, resource: &str, value: &str) {
        join_all(self.stores.iter().map(|store| store.release(resource, value))).await;
    }

    async fn authoritative_lock(&self, resource: &str) -> Option<AuthoritativeLock> {
        let start = self.clock.now_ms();
        let replies = join_all(self.stores.iter().map(|store| store.query_ttl(resource))).await;
        let elapsed = self.clock.now_ms().saturating_sub(start);

        let mut ttls_by_value: HashMap<String, Vec<u64>> = HashMap::new();
        for entry in replies.into_iter().flatten() {
            ttls_by_value
                .entry(entry.value)
                .or_default()
                .push(entry.ttl_ms);
        }

        let (value, mut ttls) = ttls_by_value
            .into_iter()
            .max_by_key(|(_, ttls)| ttls.len())?;
        if ttls.len() < self.quorum {
            return None;
        }

        // At least `quorum` stores hold the value for the quorum-th longest TTL
        ttls.sort_unstable_by(|a, b| b.cmp(a));
        let min_ttl = ttls[self.quorum - 1];
        let remaining = min_ttl as i128 - elapsed as i128 - drift_ms(min_ttl) as i128;
        if remaining < 0 {
            return None;
        }

        Some(AuthoritativeLock {
            value,
            ttl_ms: remaining as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lock::RetryDelay;
    use redquorum_store::MemoryStore;
    use std::time::Duration;

    fn stores(n: usize) -> Vec<MemoryStore> {
        (0..n).map(|i| MemoryStore::new(format!("mem-{}", i))).collect()
    }

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig::new()
            .with_retry_count(2)
            .with_retry_delay(RetryDelay::Fixed(5))
            .with_retry_jitter(0)
    }

    fn coordinator(stores: &[MemoryStore]) -> LockCoordinator {
        LockCoordinator::new(stores.iter().cloned(), fast_config()).unwrap()
    }

    #[test]
    fn test_empty_store_list_rejected() {
        let err = LockCoordinator::new(Vec::<MemoryStore>::new(), CoordinatorConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, RedlockError::Config(_)));
    }

    #[test]
    fn test_invalid_url_rejected() {
        let err = LockCoordinator::new(vec!["not a url"], CoordinatorConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, RedlockError::Store(StoreError::InvalidUrl { .. })));
    }

    #[test]
    fn test_quorum_from_store_count() {
        assert_eq!(coordinator(&stores(3)).quorum(), 2);
        assert_eq!(coordinator(&stores(5)).quorum(), 3);
        assert_eq!(coordinator(&stores(1)).quorum(), 1);
    }

    #[tokio::test]
    async fn test_lock_writes_token_to_every_store() {
        let stores = stores(3);
        let coordinator = coordinator(&stores);

        let handle = coordinator
            .lock("orders", 1000, LockOptions::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handle.resource, "orders");
        assert!(handle.validity_ms <= 1000 - drift_ms(1000));
        for store in &stores {
            assert_eq!(store.get("orders").as_deref(), Some(handle.value.as_str()));
        }
    }

    #[tokio::test]
    async fn test_minority_lock_is_cleaned_up() {
        let stores = stores(3);
        stores[0].insert("r", "other", Duration::from_secs(10));
        stores[1].insert("r", "other", Duration::from_secs(10));
        let coordinator = coordinator(&stores);

        let result = coordinator.lock("r", 1000, LockOptions::new()).await.unwrap();
        assert!(result.is_none());
        // the one store we did lock was released again
        assert!(stores[2].get("r").is_none());
        assert_eq!(stores[0].get("r").as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_negative_validity_fails_attempt() {
        let stores = stores(3);
        let clock = ManualClock::new(0);
        let ticking = clock.clone();
        // each reading of the clock moves it forward by a full second
        let source = Arc::new(move || {
            ticking.advance(1000);
            ticking.now_ms()
        });
        let coordinator = coordinator(&stores).with_time_source(source);

        let result = coordinator
            .lock("r", 500, LockOptions::new().with_retry_count(0))
            .await
            .unwrap();
        assert!(result.is_none());
        for store in &stores {
            assert!(store.get("r").is_none());
        }
    }

    #[tokio::test]
    async fn test_validity_uses_measured_time() {
        let stores = stores(3);
        let clock = ManualClock::new(0);
        let ticking = clock.clone();
        let source = Arc::new(move || {
            ticking.advance(100);
            ticking.now_ms()
        });
        let coordinator = coordinator(&stores).with_time_source(source);

        let handle = coordinator
            .lock("r", 1000, LockOptions::new())
            .await
            .unwrap()
            .unwrap();
        // 1000 - 100 elapsed - 12 drift
        assert_eq!(handle.validity_ms, 888);
    }

    #[tokio::test]
    async fn test_remaining_ttl_uses_quorum_minimum() {
        let stores = stores(3);
        stores[0].insert("r", "v", Duration::from_millis(9_000));
        stores[1].insert("r", "v", Duration::from_millis(5_000));
        stores[2].insert("r", "v", Duration::from_millis(1_000));
        let coordinator = coordinator(&stores);

        let ttl = coordinator.remaining_ttl_for_resource("r").await.unwrap();
        // second longest TTL minus drift; the 1s store is not needed for quorum
        assert!(ttl <= 5_000 - drift_ms(5_000));
        assert!(ttl > 4_500);
    }

    #[tokio::test]
    async fn test_remaining_ttl_majority_vote() {
        let stores = stores(5);
        stores[0].insert("r", "a", Duration::from_secs(10));
        stores[1].insert("r", "a", Duration::from_secs(10));
        stores[2].insert("r", "b", Duration::from_secs(10));
        stores[3].insert("r", "b", Duration::from_secs(10));
        stores[4].insert("r", "b", Duration::from_secs(10));
        let coordinator = coordinator(&stores);

        let handle_b = LockHandle {
            resource: "r".to_string(),
            value: "b".to_string(),
            validity_ms: 0,
        };
        let handle_a = LockHandle {
            value: "a".to_string(),
            ..handle_b.clone()
        };
        assert!(coordinator.is_valid_lock(&handle_b).await);
        assert!(!coordinator.is_valid_lock(&handle_a).await);
    }

    #[tokio::test]
    async fn test_split_values_are_not_locked() {
        let stores = stores(3);
        stores[0].insert("r", "a", Duration::from_secs(10));
        stores[1].insert("r", "b", Duration::from_secs(10));
        let coordinator = coordinator(&stores);

        assert!(!coordinator.is_locked("r").await);
        assert_eq!(coordinator.remaining_ttl_for_resource("r").await, None);
    }

    #[tokio::test]
    async fn test_preload_scripts_counts_reachable_stores() {
        let stores = stores(3);
        stores[1].set_offline(true);
        let coordinator = coordinator(&stores);

        assert_eq!(coordinator.preload_scripts().await, 2);
        assert_eq!(stores[0].script_loads(), 3);
        assert_eq!(stores[1].script_loads(), 0);
    }
}
