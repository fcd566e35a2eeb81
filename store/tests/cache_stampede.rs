//! Stampede-control tests for the cache-aside client.
//!
//! Run with: `cargo test --test cache_stampede`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use flashsale_core::environment::SystemClock;
use flashsale_store::{AtomicStore, CacheClient};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(60);

#[tokio::test]
async fn five_concurrent_mutex_readers_share_one_fallback_call() {
    let cache = CacheClient::new(AtomicStore::spawn(), Arc::new(SystemClock));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut readers = Vec::new();
    for _ in 0..5 {
        let cache = cache.clone();
        let calls = calls.clone();
        readers.push(tokio::spawn(async move {
            cache
                .get_with_mutex("shop", 1, TTL, move |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // A slow rebuild keeps the race window open.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, Infallible>(Some("payload".to_string()))
                    }
                })
                .await
        }));
    }

    for reader in readers {
        let loaded = reader.await.unwrap().unwrap();
        assert_eq!(loaded.as_deref(), Some("payload"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mutex_strategy_caches_confirmed_absence() {
    let cache = CacheClient::new(AtomicStore::spawn(), Arc::new(SystemClock));
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let calls = calls.clone();
        let loaded: Option<String> = cache
            .get_with_mutex("shop", 404, TTL, move |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(None)
                }
            })
            .await
            .unwrap();
        assert_eq!(loaded, None);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stale_logical_entry_triggers_exactly_one_rebuild() {
    let cache = CacheClient::new(AtomicStore::spawn(), Arc::new(SystemClock));
    cache
        .set_with_logical_expiry("shop", 1, &"stale".to_string(), Duration::ZERO)
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let mut readers = Vec::new();
    for _ in 0..5 {
        let cache = cache.clone();
        let calls = calls.clone();
        readers.push(tokio::spawn(async move {
            cache
                .get_with_logical_expiry("shop", 1, TTL, move |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok::<_, Infallible>(Some("rebuilt".to_string()))
                    }
                })
                .await
        }));
    }

    // Nobody blocks on the rebuild: everyone gets the stale value.
    for reader in readers {
        let loaded = reader.await.unwrap().unwrap();
        assert_eq!(loaded.as_deref(), Some("stale"));
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(calls.load(Ordering::SeqCst) <= 1);
    let loaded: Option<String> = cache
        .get_with_logical_expiry("shop", 1, TTL, |_| async {
            Ok::<_, Infallible>(None)
        })
        .await
        .unwrap();
    assert_eq!(loaded.as_deref(), Some("rebuilt"));
}
