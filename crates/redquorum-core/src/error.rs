//! Coordinator error types

use redquorum_store::StoreError;

/// Errors surfaced by the lock coordinator.
///
/// A lock that is simply held elsewhere is not an error: `lock` returns
/// `Ok(None)` in that case.
#[derive(Debug, thiserror::Error)]
pub enum RedlockError {
    /// Acquisition failed and the caller asked for a guaranteed lock
    #[error("failed to acquire lock on '{resource}'")]
    NotAcquired { resource: String },

    /// A quorum of stores failed with errors during one attempt
    #[error(
        "too many store errors prevented lock acquisition on '{resource}': {}",
        join_errors(errors)
    )]
    QuorumUnreachable {
        resource: String,
        errors: Vec<StoreError>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

fn join_errors(errors: &[StoreError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, RedlockError>;
