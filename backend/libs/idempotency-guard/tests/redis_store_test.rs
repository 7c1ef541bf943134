//! Integration tests for the Redis idempotency store.
//!
//! ```bash
//! export REDIS_URL="redis://127.0.0.1:6379"
//! cargo test --package idempotency-guard --test redis_store_test -- --ignored
//! ```

use futures_util::future::join_all;
use idempotency_guard::{Guarded, IdempotencyError, IdempotencyGuard, RedisIdempotencyStore};
use serial_test::serial;
use std::env;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn unique_key(label: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("test:{label}:{nanos}")
}

async fn create_guard() -> IdempotencyGuard<RedisIdempotencyStore> {
    let url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let client = redis::Client::open(url).expect("Invalid REDIS_URL");
    let conn = client
        .get_connection_manager()
        .await
        .expect("Failed to connect to Redis");
    IdempotencyGuard::new(Arc::new(RedisIdempotencyStore::new(conn)))
}

#[ignore = "Requires Redis"]
#[tokio::test]
#[serial]
async fn test_concurrent_reserve_single_winner() {
    let guard = create_guard().await;
    let key = unique_key("race");

    let results = join_all((0..16).map(|_| guard.reserve(&key, Duration::from_secs(30)))).await;
    let winners: Vec<_> = results
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|r| !r.already_reserved)
        .collect();
    assert_eq!(winners.len(), 1);

    assert!(guard.release(&key, &winners[0]).await.unwrap());
}

#[ignore = "Requires Redis"]
#[tokio::test]
#[serial]
async fn test_release_allows_retry() {
    let guard = create_guard().await;
    let key = unique_key("retry");

    let failed: Result<Guarded<()>, IdempotencyError> = guard
        .run_once(&key, || async {
            Err(IdempotencyError::Other(anyhow::anyhow!("write failed")))
        })
        .await;
    assert!(failed.is_err());

    let retried: Result<_, IdempotencyError> = guard.run_once(&key, || async { Ok(1) }).await;
    assert!(matches!(retried, Ok(Guarded::Completed(1))));

    let duplicate: Result<_, IdempotencyError> = guard.run_once(&key, || async { Ok(2) }).await;
    assert!(matches!(duplicate, Ok(Guarded::Duplicate)));
}

#[ignore = "Requires Redis"]
#[tokio::test]
#[serial]
async fn test_stale_owner_cannot_release_newer_reservation() {
    let guard = create_guard().await;
    let key = unique_key("stale");

    let first = guard.reserve(&key, Duration::from_millis(200)).await.unwrap();
    assert!(!first.already_reserved);
    tokio::time::sleep(Duration::from_millis(400)).await;

    let second = guard.reserve(&key, Duration::from_secs(30)).await.unwrap();
    assert!(!second.already_reserved);

    assert!(!guard.release(&key, &first).await.unwrap());
    assert!(guard.reserve(&key, Duration::from_secs(30)).await.unwrap().already_reserved);

    assert!(guard.release(&key, &second).await.unwrap());
}

#[ignore = "Requires Redis"]
#[tokio::test]
#[serial]
async fn test_pending_reservation_expires() {
    let guard = create_guard().await;
    let key = unique_key("expiry");

    assert!(
        !guard
            .reserve(&key, Duration::from_millis(200))
            .await
            .unwrap()
            .already_reserved
    );
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        !guard
            .reserve(&key, Duration::from_millis(200))
            .await
            .unwrap()
            .already_reserved
    );
}
