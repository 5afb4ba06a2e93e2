//! Redquorum Store - per-instance lock primitives
//!
//! This crate provides:
//! - The three atomic server-side scripts (acquire/extend, release, query)
//! - `StoreBackend`: the minimal interface a backing store must expose
//! - `StoreHandle`: script-id caching with one reload-and-retry on cache miss
//! - `RedisStore`: the Redis backend
//! - `MemoryStore`: an in-process backend with fault injection, used as a fake
//! - `StoreDescriptor`: normalization of URLs, clients and custom backends

pub mod backend;
pub mod descriptor;
pub mod error;
pub mod handle;
pub mod memory;
pub mod redis_store;
pub mod script;

pub use backend::StoreBackend;
pub use descriptor::StoreDescriptor;
pub use error::{Result, StoreError};
pub use handle::StoreHandle;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use script::{LockScript, ScriptCall, ScriptIds, ScriptKind, ScriptReply, StoredLock};

/// Default Redis URL used when no store is configured
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
