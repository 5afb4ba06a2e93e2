//! Store handle: one backend plus its cached script ids
//!
//! Every primitive runs through [`StoreHandle::run_script`], which retries
//! exactly once after reloading all scripts when the store reports that a
//! script id is unknown. Reloads are serialized per handle and keyed by a
//! generation counter, so concurrent callers that hit the same cache miss
//! share a single reload.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::backend::StoreBackend;
use crate::error::{Result, StoreError};
use crate::script::{ScriptCall, ScriptIds, ScriptKind, ScriptReply, StoredLock};

#[derive(Default)]
struct ScriptCache {
    ids: Option<Arc<ScriptIds>>,
    generation: u64,
}

/// Wraps one backing store for the lock coordinator
pub struct StoreHandle {
    backend: Arc<dyn StoreBackend>,
    timeout: Duration,
    scripts: RwLock<ScriptCache>,
}

impl StoreHandle {
    pub fn new(backend: Arc<dyn StoreBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            scripts: RwLock::new(ScriptCache::default()),
        }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Load all scripts now instead of on first use
    pub async fn preload_scripts(&self) -> Result<()> {
        let mut cache = self.scripts.write().await;
        let ids = self.load_all().await?;
        cache.ids = Some(Arc::new(ids));
        cache.generation += 1;
        Ok(())
    }

    /// Set `resource` to `value` with `ttl_ms` if it is absent (and `allow_new`)
    /// or already holds `value`. Returns whether the key was written.
    pub async fn acquire_or_extend(
        &self,
        resource: &str,
        value: &str,
        ttl_ms: u64,
        allow_new: bool,
    ) -> Result<bool> {
        let call = ScriptCall::AcquireOrExtend {
            value,
            ttl_ms,
            allow_new,
        };
        match self.run_script(resource, &call).await? {
            ScriptReply::Acquired(acquired) => Ok(acquired),
            other => Err(unexpected_reply(call.kind(), &other)),
        }
    }

    /// Delete `resource` if it still holds `value`. Never fails: a lock that
    /// cannot be released here simply expires through its TTL.
    pub async fn release(&self, resource: &str, value: &str) {
        match self.run_script(resource, &ScriptCall::Release { value }).await {
            Ok(ScriptReply::Released(released)) => {
                debug!(store = self.name(), resource, released, "release finished");
            }
            Ok(other) => {
                warn!(store = self.name(), resource, reply = ?other, "unexpected release reply");
            }
            Err(e) => {
                warn!(
                    store = self.name(),
                    resource,
                    error = %e,
                    "release failed, lock will expire by ttl"
                );
            }
        }
    }

    /// Current value and remaining TTL of `resource`.
    ///
    /// `None` means either that the key is absent or that the store could not
    /// be asked; callers must treat it as "no information".
    pub async fn query_ttl(&self, resource: &str) -> Option<StoredLock> {
        match self.run_script(resource, &ScriptCall::QueryTtl).await {
            Ok(ScriptReply::Entry(entry)) => entry,
            Ok(other) => {
                warn!(store = self.name(), resource, reply = ?other, "unexpected query reply");
                None
            }
            Err(e) => {
                debug!(store = self.name(), resource, error = %e, "ttl query failed");
                None
            }
        }
    }

    async fn run_script(&self, key: &str, call: &ScriptCall<'_>) -> Result<ScriptReply> {
        let (ids, generation) = self.cached_scripts().await?;
        match self.eval(&ids, key, call).await {
            Err(e) if e.is_no_script() => {
                warn!(
                    store = self.name(),
                    script = %call.kind(),
                    "script cache miss, reloading scripts"
                );
                let ids = self.reload_scripts(generation).await?;
                self.eval(&ids, key, call).await
            }
            result => result,
        }
    }

    async fn cached_scripts(&self) -> Result<(Arc<ScriptIds>, u64)> {
        {
            let cache = self.scripts.read().await;
            if let Some(ids) = &cache.ids {
                return Ok((ids.clone(), cache.generation));
            }
        }

        let mut cache = self.scripts.write().await;
        if let Some(ids) = &cache.ids {
            return Ok((ids.clone(), cache.generation));
        }
        let ids = Arc::new(self.load_all().await?);
        cache.ids = Some(ids.clone());
        cache.generation += 1;
        Ok((ids, cache.generation))
    }

    async fn reload_scripts(&self, seen_generation: u64) -> Result<Arc<ScriptIds>> {
        let mut cache = self.scripts.write().await;
        if cache.generation != seen_generation
            && let Some(ids) = &cache.ids
        {
            debug!(store = self.name(), "scripts already reloaded by another caller");
            return Ok(ids.clone());
        }

        let ids = Arc::new(self.load_all().await?);
        cache.ids = Some(ids.clone());
        cache.generation += 1;
        Ok(ids)
    }

    async fn load_all(&self) -> Result<ScriptIds> {
        let acquire = self
            .bounded(self.backend.load_script(ScriptKind::AcquireOrExtend.script()))
            .await?;
        let release = self
            .bounded(self.backend.load_script(ScriptKind::Release.script()))
            .await?;
        let query = self
            .bounded(self.backend.load_script(ScriptKind::QueryTtl.script()))
            .await?;
        debug!(store = self.name(), "lock scripts loaded");
        Ok(ScriptIds {
            acquire,
            release,
            query,
        })
    }

    async fn eval(&self, ids: &ScriptIds, key: &str, call: &ScriptCall<'_>) -> Result<ScriptReply> {
        self.bounded(self.backend.eval_script(ids.get(call.kind()), key, call))
            .await
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

fn unexpected_reply(kind: ScriptKind, reply: &ScriptReply) -> StoreError {
    StoreError::UnexpectedReply {
        script: kind,
        detail: format!("{:?}", reply),
    }
}
