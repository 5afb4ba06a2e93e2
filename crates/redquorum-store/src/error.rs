//! Store-level error types

use std::time::Duration;

use crate::script::ScriptKind;

/// Error raised by a single store operation
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("script not cached: {0}")]
    NoScript(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("command error: {0}")]
    Command(String),

    #[error("unexpected reply to {script} script: {detail}")]
    UnexpectedReply { script: ScriptKind, detail: String },

    #[error("invalid store url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl StoreError {
    /// The store no longer knows the script id (e.g. after `SCRIPT FLUSH`)
    pub fn is_no_script(&self) -> bool {
        matches!(self, StoreError::NoScript(_))
    }

    /// Timeouts, refused or dropped connections
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
