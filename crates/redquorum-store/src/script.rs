//! Server-side lock scripts
//!
//! Each lock primitive runs as a single Lua script so that the check and the
//! write happen atomically on the store.

use std::fmt::{Display, Formatter};

/// Identifies one of the three lock scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    /// Create the key if absent (when allowed) or refresh it if the value matches
    AcquireOrExtend,
    /// Delete the key if the value matches
    Release,
    /// Read value and remaining TTL in one round trip
    QueryTtl,
}

impl ScriptKind {
    pub const ALL: [ScriptKind; 3] = [
        ScriptKind::AcquireOrExtend,
        ScriptKind::Release,
        ScriptKind::QueryTtl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptKind::AcquireOrExtend => "acquire_or_extend",
            ScriptKind::Release => "release",
            ScriptKind::QueryTtl => "query_ttl",
        }
    }

    pub fn script(&self) -> &'static LockScript {
        match self {
            ScriptKind::AcquireOrExtend => &ACQUIRE_OR_EXTEND,
            ScriptKind::Release => &RELEASE,
            ScriptKind::QueryTtl => &QUERY_TTL,
        }
    }
}

impl Display for ScriptKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A server-side script and the primitive it implements
#[derive(Debug)]
pub struct LockScript {
    pub kind: ScriptKind,
    pub source: &'static str,
}

// ARGV[1] = value, ARGV[2] = ttl in ms, ARGV[3] = "yes" when a new lock may be created.
// SET without KEEPTTL resets the expiry instead of extending it.
pub static ACQUIRE_OR_EXTEND: LockScript = LockScript {
    kind: ScriptKind::AcquireOrExtend,
    source: r#"
if (redis.call("exists", KEYS[1]) == 0 and ARGV[3] == "yes") or redis.call("get", KEYS[1]) == ARGV[1] then
  redis.call("set", KEYS[1], ARGV[1], "PX", ARGV[2])
  return 1
end
return 0
"#,
};

pub static RELEASE: LockScript = LockScript {
    kind: ScriptKind::Release,
    source: r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
  return redis.call("del", KEYS[1])
end
return 0
"#,
};

pub static QUERY_TTL: LockScript = LockScript {
    kind: ScriptKind::QueryTtl,
    source: r#"
return { redis.call("get", KEYS[1]), redis.call("pttl", KEYS[1]) }
"#,
};

/// Arguments for one script invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptCall<'a> {
    AcquireOrExtend {
        value: &'a str,
        ttl_ms: u64,
        allow_new: bool,
    },
    Release {
        value: &'a str,
    },
    QueryTtl,
}

impl ScriptCall<'_> {
    pub fn kind(&self) -> ScriptKind {
        match self {
            ScriptCall::AcquireOrExtend { .. } => ScriptKind::AcquireOrExtend,
            ScriptCall::Release { .. } => ScriptKind::Release,
            ScriptCall::QueryTtl => ScriptKind::QueryTtl,
        }
    }

    /// ARGV as passed to the Lua script
    pub fn args(&self) -> Vec<String> {
        match self {
            ScriptCall::AcquireOrExtend {
                value,
                ttl_ms,
                allow_new,
            } => vec![
                value.to_string(),
                ttl_ms.to_string(),
                if *allow_new { "yes" } else { "no" }.to_string(),
            ],
            ScriptCall::Release { value } => vec![value.to_string()],
            ScriptCall::QueryTtl => Vec::new(),
        }
    }
}

/// Value currently stored for a resource and its remaining expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLock {
    pub value: String,
    pub ttl_ms: u64,
}

/// Decoded script result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptReply {
    Acquired(bool),
    Released(bool),
    Entry(Option<StoredLock>),
}

/// Script identifiers as returned by the store when loading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptIds {
    pub acquire: String,
    pub release: String,
    pub query: String,
}

impl ScriptIds {
    pub fn get(&self, kind: ScriptKind) -> &str {
        match kind {
            ScriptKind::AcquireOrExtend => &self.acquire,
            ScriptKind::Release => &self.release,
            ScriptKind::QueryTtl => &self.query,
        }
    }
}
