//! Background keep-alive for a held lock

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, warn};

use super::model::{LockHandle, LockOptions};
use super::service::LockCoordinator;

/// Running keep-alive task. Dropping it stops the renewals.
pub struct LockRenewal {
    stop_tx: mpsc::Sender<()>,
    latest: watch::Receiver<LockHandle>,
    task: JoinHandle<()>,
}

impl LockRenewal {
    /// Handle from the most recent successful extension
    pub fn latest(&self) -> LockHandle {
        self.latest.borrow().clone()
    }

    /// False once the task stopped, either on request or because the lock was lost
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop renewing and return the latest handle. The lock itself stays held
    /// until it is released or expires.
    pub async fn stop(self) -> LockHandle {
        let _ = self.stop_tx.try_send(());
        if let Err(e) = self.task.await {
            error!(error = %e, "lock renewal task failed");
        }
        self.latest.borrow().clone()
    }
}

impl LockCoordinator {
    /// Extend `handle` by `ttl_ms` every third of the TTL until stopped.
    ///
    /// Renewal only extends a lock still held under the handle's token; the
    /// task ends on its own once an extension fails.
    pub fn keep_alive(&self, handle: LockHandle, ttl_ms: u64) -> LockRenewal {
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let (latest_tx, latest) = watch::channel(handle);
        let period = Duration::from_millis((ttl_ms / 3).max(1));
        let coordinator = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let current = latest_tx.borrow().clone();
                        let options = LockOptions::extend(current.clone()).only_if_locked();
                        match coordinator.lock(&current.resource, ttl_ms, options).await {
                            Ok(Some(renewed)) => {
                                debug!(
                                    resource = %renewed.resource,
                                    validity_ms = renewed.validity_ms,
                                    "lock renewed"
                                );
                                latest_tx.send_replace(renewed);
                            }
                            Ok(None) => {
                                warn!(resource = %current.resource, "lock lost, renewal stopped");
                                break;
                            }
                            Err(e) => {
                                error!(resource = %current.resource, error = %e, "lock renewal error");
                                break;
                            }
                        }
                    }
                    _ = stop_rx.recv() => {
                        break;
                    }
                }
            }
        });

        LockRenewal {
            stop_tx,
            latest,
            task,
        }
    }
}
