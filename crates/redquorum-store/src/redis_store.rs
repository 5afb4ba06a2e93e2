//! Redis backend
//!
//! Scripts are loaded with `SCRIPT LOAD` and run with `EVALSHA`; a `NOSCRIPT`
//! reply is surfaced as [`StoreError::NoScript`] so the handle can reload.
//! The connection is opened lazily and shared through a `ConnectionManager`,
//! which reconnects on its own after the link drops.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, ErrorKind, RedisError};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::backend::StoreBackend;
use crate::error::{Result, StoreError};
use crate::script::{LockScript, ScriptCall, ScriptReply, StoredLock};

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if matches!(err.kind(), ErrorKind::NoScriptError) {
            StoreError::NoScript(err.to_string())
        } else if err.is_timeout()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_io_error()
        {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// Redis-backed store
pub struct RedisStore {
    name: String,
    client: Option<Client>,
    connection: OnceCell<ConnectionManager>,
}

impl RedisStore {
    /// Create a store from a `redis://` or `rediss://` URL. No I/O happens here.
    pub fn open(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| StoreError::InvalidUrl {
            url: redact_url(url),
            reason: e.to_string(),
        })?;
        Ok(Self {
            name: display_name(url),
            client: Some(client),
            connection: OnceCell::new(),
        })
    }

    /// Wrap an existing client
    pub fn from_client(name: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            client: Some(client),
            connection: OnceCell::new(),
        }
    }

    /// Wrap an already connected manager
    pub fn from_connection(name: impl Into<String>, connection: ConnectionManager) -> Self {
        Self {
            name: name.into(),
            client: None,
            connection: OnceCell::new_with(Some(connection)),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                let client = self.client.clone().ok_or_else(|| {
                    StoreError::Connection(format!("no client configured for {}", self.name))
                })?;
                debug!(store = %self.name, "connecting to redis");
                ConnectionManager::new(client)
                    .await
                    .map_err(StoreError::from)
            })
            .await?;
        Ok(connection.clone())
    }
}

#[async_trait]
impl StoreBackend for RedisStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_script(&self, script: &LockScript) -> Result<String> {
        let mut connection = self.connection().await?;
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script.source)
            .query_async(&mut connection)
            .await?;
        Ok(sha)
    }

    async fn eval_script(
        &self,
        script_id: &str,
        key: &str,
        call: &ScriptCall<'_>,
    ) -> Result<ScriptReply> {
        let mut connection = self.connection().await?;
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(script_id).arg(1).arg(key).arg(call.args());

        match call {
            ScriptCall::AcquireOrExtend { .. } => {
                let written: i64 = cmd.query_async(&mut connection).await?;
                Ok(ScriptReply::Acquired(written == 1))
            }
            ScriptCall::Release { .. } => {
                let deleted: i64 = cmd.query_async(&mut connection).await?;
                Ok(ScriptReply::Released(deleted > 0))
            }
            ScriptCall::QueryTtl => {
                let (value, ttl_ms): (Option<String>, Option<i64>) =
                    cmd.query_async(&mut connection).await?;
                Ok(ScriptReply::Entry(stored_lock(value, ttl_ms)))
            }
        }
    }
}

/// `PTTL` returns -2 for a missing key and -1 for a key without expiry;
/// neither describes a lock.
fn stored_lock(value: Option<String>, ttl_ms: Option<i64>) -> Option<StoredLock> {
    match (value, ttl_ms) {
        (Some(value), Some(ttl)) if ttl >= 0 => Some(StoredLock {
            value,
            ttl_ms: ttl as u64,
        }),
        _ => None,
    }
}

/// `host:port/db` without user info
fn display_name(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or("localhost");
            let port = parsed.port().unwrap_or(6379);
            let db = parsed.path().trim_start_matches('/');
            if db.is_empty() {
                format!("{}:{}", host, port)
            } else {
                format!("{}:{}/{}", host, port, db)
            }
        }
        Err(_) => redact_url(url),
    }
}

fn redact_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => match rest.rsplit_once('@') {
            Some((_, host)) => format!("{}://***@{}", scheme, host),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}
