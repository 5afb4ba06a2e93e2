//! Redlock implementation
//!
//! This module provides:
//! - Lock handle and per-call options (model)
//! - Coordinator configuration and retry policy (config)
//! - Quorum acquire/extend/release/query protocol (service)
//! - Scoped execution with guaranteed release (scoped)
//! - Background keep-alive renewal (renewal)

mod config;
mod model;
mod renewal;
mod scoped;
mod service;

pub use config::*;
pub use model::*;
pub use renewal::*;
pub use service::*;
