//! Subcommand execution

use std::io::Write;
use std::process::ExitStatus;

use anyhow::Context;
use redquorum_core::{LockCoordinator, LockHandle, LockOptions};
use tokio::process::Command as Process;
use tracing::{info, warn};

use crate::config::Command;

pub const EXIT_OK: u8 = 0;
/// The lock could not be obtained, or the resource is not locked
pub const EXIT_NOT_LOCKED: u8 = 1;
pub const EXIT_ERROR: u8 = 2;

/// Run `command` and return the process exit code
pub async fn execute(
    coordinator: &LockCoordinator,
    command: Command,
    out: &mut impl Write,
) -> anyhow::Result<u8> {
    match command {
        Command::Lock {
            resource,
            ttl,
            extend,
            only_if_locked,
            retry_count,
        } => {
            let mut options = match extend {
                Some(token) => LockOptions::extend(handle_for(&resource, token)),
                None => LockOptions::new(),
            };
            if only_if_locked {
                options = options.only_if_locked();
            }
            if let Some(retry_count) = retry_count {
                options = options.with_retry_count(retry_count);
            }

            match coordinator.lock(&resource, ttl, options).await? {
                Some(handle) => {
                    writeln!(out, "{}", serde_json::to_string(&handle)?)?;
                    Ok(EXIT_OK)
                }
                None => {
                    warn!(resource = %resource, "lock not acquired");
                    Ok(EXIT_NOT_LOCKED)
                }
            }
        }
        Command::Unlock { resource, token } => {
            coordinator.unlock(&handle_for(&resource, token)).await;
            Ok(EXIT_OK)
        }
        Command::Ttl { resource, token } => {
            let remaining = match token {
                Some(token) => {
                    coordinator
                        .remaining_ttl_for_lock(&handle_for(&resource, token))
                        .await
                }
                None => coordinator.remaining_ttl_for_resource(&resource).await,
            };
            match remaining {
                Some(ms) => {
                    writeln!(out, "{}", ms)?;
                    Ok(EXIT_OK)
                }
                None => {
                    writeln!(out, "unlocked")?;
                    Ok(EXIT_NOT_LOCKED)
                }
            }
        }
        Command::Status { resource } => {
            if coordinator.is_locked(&resource).await {
                writeln!(out, "locked")?;
                Ok(EXIT_OK)
            } else {
                writeln!(out, "unlocked")?;
                Ok(EXIT_NOT_LOCKED)
            }
        }
        Command::Run {
            resource,
            ttl,
            command,
        } => run_with_lock(coordinator, &resource, ttl, &command).await,
    }
}

/// Hold `resource` with keep-alive while `argv` runs. The lock is released
/// however the child ends.
async fn run_with_lock(
    coordinator: &LockCoordinator,
    resource: &str,
    ttl_ms: u64,
    argv: &[String],
) -> anyhow::Result<u8> {
    let outcome = coordinator
        .run_locked(resource, ttl_ms, LockOptions::new(), |handle| async move {
            info!(resource = %handle.resource, command = ?argv, "lock acquired, starting command");
            let renewal = coordinator.keep_alive(handle, ttl_ms);
            let status = supervise(argv).await;
            if !renewal.is_active() {
                warn!(resource, "lock was lost while the command was running");
            }
            renewal.stop().await;
            status
        })
        .await?;

    match outcome {
        Some(status) => Ok(exit_code(status?.code())),
        None => {
            warn!(resource, "lock not acquired, command not started");
            Ok(EXIT_NOT_LOCKED)
        }
    }
}

/// Spawn the child and wait for it, forwarding Ctrl+C as a kill
async fn supervise(argv: &[String]) -> anyhow::Result<ExitStatus> {
    let (program, args) = argv.split_first().context("no command given")?;
    let mut child = Process::new(program)
        .args(args)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start {}", program))?;

    tokio::select! {
        status = child.wait() => Ok(status?),
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, stopping command");
            child.kill().await?;
            Ok(child.wait().await?)
        }
    }
}

/// Child exit code, or `EXIT_ERROR` when killed by a signal or out of range
fn exit_code(code: Option<i32>) -> u8 {
    code.and_then(|code| u8::try_from(code).ok())
        .unwrap_or(EXIT_ERROR)
}

fn handle_for(resource: &str, token: String) -> LockHandle {
    LockHandle {
        resource: resource.to_string(),
        value: token,
        validity_ms: 0,
    }
}
