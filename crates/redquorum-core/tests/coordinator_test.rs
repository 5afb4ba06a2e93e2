// Integration tests for LockCoordinator
// Exercises the quorum protocol end to end over in-memory stores with fault injection

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use redquorum_core::{
    CancelSignal, CoordinatorConfig, LockCoordinator, LockHandle, LockOptions, MemoryStore,
    RedlockError, RetryDelay, StoreError, drift_ms,
};
use redquorum_core::lock::MAX_TTL_MS;
use tokio::time::Instant;

fn stores(n: usize) -> Vec<MemoryStore> {
    (0..n).map(|i| MemoryStore::new(format!("node-{}", i))).collect()
}

fn coordinator_with(stores: &[MemoryStore], config: CoordinatorConfig) -> LockCoordinator {
    LockCoordinator::new(stores.iter().cloned(), config).unwrap()
}

fn coordinator(stores: &[MemoryStore]) -> LockCoordinator {
    coordinator_with(
        stores,
        CoordinatorConfig::new()
            .with_retry_count(1)
            .with_retry_delay(RetryDelay::Fixed(10))
            .with_retry_jitter(0),
    )
}

#[tokio::test]
async fn test_lock_is_exclusive() {
    let stores = stores(3);
    let coordinator = coordinator(&stores);

    let first = coordinator
        .lock("invoice:42", 5000, LockOptions::new())
        .await
        .unwrap();
    assert!(first.is_some());

    let second = coordinator
        .lock("invoice:42", 5000, LockOptions::new())
        .await
        .unwrap();
    assert!(second.is_none());

    // Failed attempts must not disturb the holder
    let holder = first.unwrap();
    for store in &stores {
        assert_eq!(store.get("invoice:42"), Some(holder.value.clone()));
    }
}

#[tokio::test]
async fn test_unlock_then_relock_gets_new_token() {
    let stores = stores(3);
    let coordinator = coordinator(&stores);

    let first = coordinator
        .lock_or_fail("report", 5000, LockOptions::new())
        .await
        .unwrap();
    coordinator.unlock(&first).await;
    assert!(!coordinator.is_locked("report").await);

    let second = coordinator
        .lock_or_fail("report", 5000, LockOptions::new())
        .await
        .unwrap();
    assert_ne!(first.value, second.value);
}

#[tokio::test]
async fn test_unlock_is_idempotent() {
    let stores = stores(3);
    let coordinator = coordinator(&stores);

    let handle = coordinator
        .lock_or_fail("r", 5000, LockOptions::new())
        .await
        .unwrap();
    coordinator.unlock(&handle).await;
    coordinator.unlock(&handle).await;
    assert!(stores.iter().all(|s| s.get("r").is_none()));
}

#[tokio::test]
async fn test_unlock_ignores_foreign_token() {
    let stores = stores(3);
    let coordinator = coordinator(&stores);

    let handle = coordinator
        .lock_or_fail("r", 5000, LockOptions::new())
        .await
        .unwrap();
    let impostor = LockHandle {
        value: "not-the-owner".to_string(),
        ..handle.clone()
    };
    coordinator.unlock(&impostor).await;
    assert!(coordinator.is_valid_lock(&handle).await);
}

#[tokio::test]
async fn test_validity_is_within_ttl() {
    let stores = stores(5);
    let coordinator = coordinator(&stores);

    for ttl in [200, 1000, 30_000] {
        let resource = format!("ttl-{}", ttl);
        let handle = coordinator
            .lock_or_fail(&resource, ttl, LockOptions::new())
            .await
            .unwrap();
        assert!(handle.validity_ms <= ttl - drift_ms(ttl));
    }
}

#[tokio::test]
async fn test_remaining_ttl_close_to_requested() {
    let stores = stores(3);
    let coordinator = coordinator(&stores);

    let handle = coordinator
        .lock_or_fail("r", 10_000, LockOptions::new())
        .await
        .unwrap();
    let ttl = coordinator.remaining_ttl_for_lock(&handle).await.unwrap();
    assert!(ttl <= 10_000);
    assert!(ttl >= 9_700, "remaining ttl {} too far from 10s", ttl);
    assert!(coordinator.remaining_ttl_for_resource("r").await.is_some());
}

#[tokio::test]
async fn test_remaining_ttl_unknown_resource() {
    let stores = stores(3);
    let coordinator = coordinator(&stores);
    assert_eq!(coordinator.remaining_ttl_for_resource("nothing").await, None);
    assert!(!coordinator.is_locked("nothing").await);
}

#[tokio::test(start_paused = true)]
async fn test_expired_lock_can_be_taken() {
    let stores = stores(3);
    let coordinator = coordinator(&stores);

    let first = coordinator
        .lock_or_fail("short", 100, LockOptions::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!coordinator.is_valid_lock(&first).await);
    let second = coordinator
        .lock("short", 100, LockOptions::new())
        .await
        .unwrap();
    assert!(second.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_extend_keeps_token_and_refreshes_ttl() {
    let stores = stores(3);
    let coordinator = coordinator(&stores);

    let handle = coordinator
        .lock_or_fail("r", 1000, LockOptions::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    let extended = coordinator
        .lock_or_fail("r", 5000, LockOptions::extend(handle.clone()))
        .await
        .unwrap();
    assert_eq!(extended.value, handle.value);
    assert!(stores[0].remaining_ttl("r").unwrap() > Duration::from_millis(4000));
}

#[tokio::test]
async fn test_extend_only_if_locked_on_absent_resource() {
    let stores = stores(3);
    let coordinator = coordinator(&stores);
    let stale = LockHandle {
        resource: "gone".to_string(),
        value: "old-token".to_string(),
        validity_ms: 0,
    };

    let result = coordinator
        .lock("gone", 5000, LockOptions::extend(stale).only_if_locked())
        .await
        .unwrap();
    assert!(result.is_none());
    assert!(stores.iter().all(|s| s.get("gone").is_none()));
}

#[tokio::test]
async fn test_extend_absent_resource_creates_with_token() {
    let stores = stores(3);
    let coordinator = coordinator(&stores);
    let stale = LockHandle {
        resource: "gone".to_string(),
        value: "chosen-token".to_string(),
        validity_ms: 0,
    };

    let handle = coordinator
        .lock_or_fail("gone", 5000, LockOptions::extend(stale))
        .await
        .unwrap();
    assert_eq!(handle.value, "chosen-token");
    assert!(stores.iter().all(|s| s.get("gone").as_deref() == Some("chosen-token")));
}

#[tokio::test]
async fn test_extend_held_by_other_fails_without_retry() {
    let stores = stores(3);
    for store in &stores {
        store.insert("r", "other", Duration::from_secs(10));
    }
    let coordinator = coordinator_with(
        &stores,
        CoordinatorConfig::new()
            .with_retry_count(5)
            .with_retry_delay(RetryDelay::Fixed(10_000)),
    );
    let mine = LockHandle {
        resource: "r".to_string(),
        value: "mine".to_string(),
        validity_ms: 0,
    };

    let start = Instant::now();
    let result = coordinator
        .lock("r", 5000, LockOptions::extend(mine))
        .await
        .unwrap();
    assert!(result.is_none());
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_minority_outage_is_tolerated() {
    let stores = stores(3);
    stores[2].set_offline(true);
    let coordinator = coordinator(&stores);

    let handle = coordinator
        .lock_or_fail("r", 5000, LockOptions::new())
        .await
        .unwrap();
    assert!(coordinator.is_valid_lock(&handle).await);

    coordinator.unlock(&handle).await;
    assert!(!coordinator.is_locked("r").await);
}

#[tokio::test(start_paused = true)]
async fn test_majority_outage_fails_fast_with_all_errors() {
    let stores = stores(3);
    stores[0].set_offline(true);
    stores[1].set_offline(true);
    let coordinator = coordinator_with(
        &stores,
        CoordinatorConfig::new()
            .with_retry_count(10)
            .with_retry_delay(RetryDelay::Fixed(60_000)),
    );

    let start = Instant::now();
    let err = coordinator
        .lock("r", 5000, LockOptions::new())
        .await
        .unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(1));

    match err {
        RedlockError::QuorumUnreachable { resource, errors } => {
            assert_eq!(resource, "r");
            assert_eq!(errors.len(), 2);
            assert!(errors.iter().all(|e| matches!(e, StoreError::Connection(_))));
        }
        other => panic!("unexpected error {:?}", other),
    }
    // the reachable store was cleaned up
    assert!(stores[2].get("r").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_slow_majority_times_out() {
    let stores = stores(3);
    stores[0].set_latency(Duration::from_secs(1));
    stores[1].set_latency(Duration::from_secs(1));
    let coordinator = coordinator_with(
        &stores,
        CoordinatorConfig::new()
            .with_retry_count(0)
            .with_store_timeout(Duration::from_millis(50)),
    );

    let err = coordinator
        .lock("r", 5000, LockOptions::new())
        .await
        .unwrap_err();
    match err {
        RedlockError::QuorumUnreachable { errors, .. } => {
            assert!(errors.iter().all(|e| matches!(e, StoreError::Timeout(_))));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_retries_until_budget_exhausted() {
    let stores = stores(3);
    for store in &stores {
        store.insert("busy", "other", Duration::from_secs(10));
    }
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let delay = RetryDelay::per_attempt(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        1
    });

    let coordinator = coordinator(&stores);
    let result = coordinator
        .lock(
            "busy",
            1000,
            LockOptions::new()
                .with_retry_count(4)
                .with_retry_delay(delay)
                .with_retry_jitter(0),
        )
        .await
        .unwrap();
    assert!(result.is_none());
    // one sleep before each retry
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_lock_or_fail_reports_not_acquired() {
    let stores = stores(3);
    for store in &stores {
        store.insert("busy", "other", Duration::from_secs(10));
    }
    let coordinator = coordinator(&stores);

    let err = coordinator
        .lock_or_fail("busy", 1000, LockOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "failed to acquire lock on 'busy'");
}

#[tokio::test]
async fn test_lock_survives_script_flush() {
    let stores = stores(3);
    let coordinator = coordinator(&stores);

    let handle = coordinator
        .lock_or_fail("r", 5000, LockOptions::new())
        .await
        .unwrap();
    for store in &stores {
        store.flush_scripts();
    }

    coordinator.unlock(&handle).await;
    assert!(!coordinator.is_locked("r").await);
    assert!(
        coordinator
            .lock("r", 5000, LockOptions::new())
            .await
            .unwrap()
            .is_some()
    );
    for store in &stores {
        assert_eq!(store.script_loads(), 6);
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_between_attempts() {
    let stores = stores(3);
    for store in &stores {
        store.insert("busy", "other", Duration::from_secs(600));
    }
    let coordinator = coordinator_with(
        &stores,
        CoordinatorConfig::new()
            .with_retry_count(100)
            .with_retry_delay(RetryDelay::Fixed(1000)),
    );
    let cancel = CancelSignal::new();

    let task = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            coordinator
                .lock_with_cancel("busy", 1000, LockOptions::new(), &cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(2500)).await;
    let start = Instant::now();
    cancel.cancel();
    let result = task.await.unwrap().unwrap();

    assert!(result.is_none());
    assert!(start.elapsed() < Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_attempt_releases_partial_locks() {
    let stores = stores(3);
    for store in &stores {
        store.set_latency(Duration::from_millis(500));
    }
    let coordinator = coordinator_with(
        &stores,
        CoordinatorConfig::new().with_store_timeout(Duration::from_secs(2)),
    );
    let cancel = CancelSignal::new();

    let task = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            coordinator
                .lock_with_cancel("r", 5000, LockOptions::new(), &cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let result = task.await.unwrap().unwrap();

    assert!(result.is_none());
    assert!(stores.iter().all(|s| s.get("r").is_none()));
}

#[tokio::test]
async fn test_already_cancelled_does_nothing() {
    let stores = stores(3);
    let coordinator = coordinator(&stores);
    let cancel = CancelSignal::new();
    cancel.cancel();

    let result = coordinator
        .lock_with_cancel("r", 5000, LockOptions::new(), &cancel)
        .await
        .unwrap();
    assert!(result.is_none());
    assert!(stores.iter().all(|s| s.get("r").is_none()));
}

#[tokio::test]
async fn test_run_locked_returns_work_result() {
    let stores = stores(3);
    let coordinator = coordinator(&stores);

    let total = coordinator
        .run_locked_or_fail("batch", 5000, LockOptions::new(), |handle| async move {
            assert_eq!(handle.resource, "batch");
            21 * 2
        })
        .await
        .unwrap();
    assert_eq!(total, 42);
    assert!(!coordinator.is_locked("batch").await);
}

#[tokio::test]
async fn test_contended_lock_has_single_winner() {
    let stores = stores(5);
    let coordinator = coordinator_with(
        &stores,
        CoordinatorConfig::new().with_retry_count(0),
    );

    let attempts = (0..16).map(|_| {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .lock("leader", 10_000, LockOptions::new())
                .await
                .unwrap()
        })
    });
    let results = futures::future::join_all(attempts).await;
    let winners = results
        .into_iter()
        .filter_map(|r| r.unwrap())
        .count();
    assert!(winners <= 1);
}

#[tokio::test]
async fn test_unbounded_retry_count_still_acquires() {
    let stores = stores(3);
    let coordinator = coordinator_with(
        &stores,
        CoordinatorConfig::new().with_retry_count(u32::MAX),
    );

    let handle = coordinator
        .lock("r", 1000, LockOptions::new().with_retry_count(u32::MAX))
        .await
        .unwrap()
        .unwrap();
    assert!(stores.iter().all(|s| s.get("r") == Some(handle.value.clone())));

    let other = coordinator
        .lock("other", 1000, LockOptions::new())
        .await
        .unwrap();
    assert!(other.is_some());
}

#[tokio::test]
async fn test_ttl_beyond_store_range_is_rejected() {
    let stores = stores(3);
    let coordinator = coordinator(&stores);

    let err = coordinator
        .lock("r", u64::MAX, LockOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RedlockError::Config(_)));
    assert!(stores.iter().all(|s| s.get("r").is_none()));
}

#[tokio::test]
async fn test_largest_ttl_is_accepted() {
    let stores = stores(3);
    let coordinator = coordinator(&stores);

    let handle = coordinator
        .lock_or_fail("r", MAX_TTL_MS, LockOptions::new())
        .await
        .unwrap();
    assert!(handle.validity_ms > MAX_TTL_MS / 2);
    assert!(handle.validity_ms <= MAX_TTL_MS - drift_ms(MAX_TTL_MS));
    assert!(coordinator.is_valid_lock(&handle).await);
}
