//! Redquorum CLI - command line access to quorum locks
//!
//! This crate provides:
//! - Argument parsing and layered settings (config)
//! - Logging setup (logging)
//! - The `lock`, `unlock`, `ttl`, `status` and `run` commands (commands)

pub mod commands;
pub mod config;
pub mod logging;
