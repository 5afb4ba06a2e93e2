//! Backend interface implemented by every store

use async_trait::async_trait;

use crate::error::Result;
use crate::script::{LockScript, ScriptCall, ScriptReply};

/// Minimal interface a backing store exposes to the lock protocol.
///
/// Implementations only load and run scripts; caching the returned ids and
/// recovering from a flushed script cache is done by [`crate::StoreHandle`].
/// A pool-backed implementation borrows a connection inside each call.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Human-readable store name for logs (never contains credentials)
    fn name(&self) -> &str;

    /// Load a script into the store's script cache and return its id
    async fn load_script(&self, script: &LockScript) -> Result<String>;

    /// Run a previously loaded script against `key`.
    ///
    /// Must fail with [`crate::StoreError::NoScript`] when `script_id` is unknown.
    async fn eval_script(
        &self,
        script_id: &str,
        key: &str,
        call: &ScriptCall<'_>,
    ) -> Result<ScriptReply>;
}
