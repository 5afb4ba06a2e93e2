// In-memory lock store
// Implements the three lock scripts over a DashMap with expiry, and exposes
// fault injection so the coordinator can be exercised without Redis.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use crate::backend::StoreBackend;
use crate::error::{Result, StoreError};
use crate::script::{LockScript, ScriptCall, ScriptKind, ScriptReply, StoredLock};

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn remaining_ms(&self, now: Instant) -> u64 {
        self.expires_at.saturating_duration_since(now).as_millis() as u64
    }
}

/// Expiry instant, clamped for TTLs beyond what `Instant` can represent
fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 3600))
}

struct MemoryInner {
    name: String,
    entries: DashMap<String, MemoryEntry>,
    scripts: DashMap<String, ScriptKind>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
    script_loads: AtomicU64,
}

/// Shared in-memory store. Clones operate on the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                name: name.into(),
                entries: DashMap::new(),
                scripts: DashMap::new(),
                offline: AtomicBool::new(false),
                latency_ms: AtomicU64::new(0),
                script_loads: AtomicU64::new(0),
            }),
        }
    }

    /// Make every call fail with a connection error
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Forget all loaded scripts, like `SCRIPT FLUSH`
    pub fn flush_scripts(&self) {
        self.inner.scripts.clear();
        debug!(store = %self.inner.name, "script cache flushed");
    }

    /// Number of script loads served so far
    pub fn script_loads(&self) -> u64 {
        self.inner.script_loads.load(Ordering::SeqCst)
    }

    /// Write a key directly, bypassing scripts (e.g. to simulate another holder)
    pub fn insert(&self, key: &str, value: &str, ttl: Duration) {
        self.inner.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: expiry(Instant::now(), ttl),
            },
        );
    }

    /// Live value stored under `key`
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.inner
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Remaining TTL of a live key
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.inner
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| Duration::from_millis(entry.remaining_ms(now)))
    }

    fn script_id(script: &LockScript) -> String {
        const_hex::encode(Sha256::digest(script.source.as_bytes()))
    }

    async fn round_trip(&self) -> Result<()> {
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.is_offline() {
            return Err(StoreError::Connection(format!(
                "store {} is unreachable",
                self.inner.name
            )));
        }
        Ok(())
    }

    fn acquire_or_extend(&self, key: &str, value: &str, ttl_ms: u64, allow_new: bool) -> bool {
        let now = Instant::now();
        let fresh = MemoryEntry {
            value: value.to_string(),
            expires_at: expiry(now, Duration::from_millis(ttl_ms)),
        };

        match self.inner.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let writable = if current.is_live(now) {
                    current.value == value
                } else {
                    allow_new
                };
                if writable {
                    occupied.insert(fresh);
                }
                writable
            }
            Entry::Vacant(vacant) => {
                if allow_new {
                    vacant.insert(fresh);
                }
                allow_new
            }
        }
    }

    fn release(&self, key: &str, value: &str) -> bool {
        let now = Instant::now();
        self.inner
            .entries
            .remove_if(key, |_, entry| entry.is_live(now) && entry.value == value)
            .is_some()
    }

    fn query(&self, key: &str) -> Option<StoredLock> {
        let now = Instant::now();
        self.inner
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| StoredLock {
                value: entry.value.clone(),
                ttl_ms: entry.remaining_ms(now),
            })
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn load_script(&self, script: &LockScript) -> Result<String> {
        self.round_trip().await?;
        let id = Self::script_id(script);
        self.inner.scripts.insert(id.clone(), script.kind);
        self.inner.script_loads.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn eval_script(
        &self,
        script_id: &str,
        key: &str,
        call: &ScriptCall<'_>,
    ) -> Result<ScriptReply> {
        self.round_trip().await?;

        let loaded = self.inner.scripts.get(script_id).map(|kind| *kind);
        if loaded != Some(call.kind()) {
            return Err(StoreError::NoScript(format!(
                "NOSCRIPT {} on {}",
                script_id, self.inner.name
            )));
        }

        let reply = match *call {
            ScriptCall::AcquireOrExtend {
                value,
                ttl_ms,
                allow_new,
            } => ScriptReply::Acquired(self.acquire_or_extend(key, value, ttl_ms, allow_new)),
            ScriptCall::Release { value } => ScriptReply::Released(self.release(key, value)),
            ScriptCall::QueryTtl => ScriptReply::Entry(self.query(key)),
        };
        Ok(reply)
    }
}
