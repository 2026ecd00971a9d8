//! Integration tests for request coalescing and offline fallback

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fetchstash::{
    CacheConfig, CacheError, KeyedStore, NetworkStatus, RequestCoordinator, RequestOptions,
};

fn coordinator_with_status(status: NetworkStatus) -> RequestCoordinator<usize> {
    let store = Arc::new(KeyedStore::new(CacheConfig::default()));
    RequestCoordinator::with_connectivity(store, Arc::new(status))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_invoke_executor_once() {
    let coordinator = coordinator_with_status(NetworkStatus::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let coordinator = coordinator.clone();
        let counter = counter.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .request(
                    "items:42",
                    move || async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
                    },
                    RequestOptions::default(),
                )
                .await
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.expect("Task should not panic"));
    }

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| *r == Ok(1)), "{:?}", results);
    assert_eq!(coordinator.pending_count(), 0);
    assert_eq!(coordinator.store().get("items:42"), Some(1));
}

#[tokio::test]
async fn test_failure_propagates_to_every_coalesced_caller() {
    let coordinator = coordinator_with_status(NetworkStatus::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let make_executor = |counter: Arc<AtomicUsize>| {
        move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<usize, _>(CacheError::RequestFailed("connection reset".to_string()))
        }
    };

    let (a, b, c) = tokio::join!(
        coordinator.request("k", make_executor(counter.clone()), RequestOptions::default()),
        coordinator.request("k", make_executor(counter.clone()), RequestOptions::default()),
        coordinator.request("k", make_executor(counter.clone()), RequestOptions::default()),
    );

    let expected = Err(CacheError::RequestFailed("connection reset".to_string()));
    assert_eq!(a, expected);
    assert_eq!(b, expected);
    assert_eq!(c, expected);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(!coordinator.is_pending("k"));
}

#[tokio::test]
async fn test_offline_serves_stale_entry_without_calling_executor() {
    let status = NetworkStatus::new();
    let coordinator = coordinator_with_status(status.clone());
    coordinator
        .store()
        .set("k", 11, Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(30)).await;
    status.set_online(false);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let result = coordinator
        .request(
            "k",
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(99)
            },
            RequestOptions::default(),
        )
        .await;

    assert_eq!(result, Ok(11));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_offline_without_any_entry_is_an_error() {
    let coordinator = coordinator_with_status(NetworkStatus::offline());

    let result = coordinator
        .request("missing", || async { Ok(1) }, RequestOptions::default())
        .await;

    assert!(matches!(result, Err(CacheError::OfflineNoCache { .. })));
}

#[tokio::test]
async fn test_abandoned_request_still_populates_cache() {
    let coordinator = coordinator_with_status(NetworkStatus::new());

    let timed_out = tokio::time::timeout(
        Duration::from_millis(20),
        coordinator.request(
            "slow",
            || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(5)
            },
            RequestOptions::default(),
        ),
    )
    .await;
    assert!(timed_out.is_err(), "Caller should have given up");

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(coordinator.store().get("slow"), Some(5));
    assert_eq!(coordinator.pending_count(), 0);
}

#[tokio::test]
async fn test_key_prefix_namespaces_entries() {
    let coordinator = coordinator_with_status(NetworkStatus::new());
    let options = RequestOptions::default().with_key_prefix("collections/");

    coordinator
        .request("1", || async { Ok(1) }, options.clone())
        .await
        .unwrap();

    assert_eq!(coordinator.store().keys(), vec!["collections/1"]);
    let cached = coordinator
        .request("1", || async { Ok(2) }, options)
        .await;
    assert_eq!(cached, Ok(1));
}

#[tokio::test]
async fn test_fetched_value_expires_after_ttl() {
    let coordinator = coordinator_with_status(NetworkStatus::new());
    let options = RequestOptions::default().with_ttl(Duration::from_millis(20));

    coordinator
        .request("k", || async { Ok(1) }, options.clone())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let refetched = coordinator.request("k", || async { Ok(2) }, options).await;
    assert_eq!(refetched, Ok(2));
}
