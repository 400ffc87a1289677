//! Property-Based Tests for Request Coalescing
//!
//! **Property: Batch Coalescing and De-duplication**
//!
//! For any stream of lookups issued within one batch window:
//! - Exactly one bulk fetch is issued
//! - Each distinct uncached ID appears in its filter exactly once
//! - Cached IDs never appear in the filter
//! - Every caller resolves with the item for the ID it requested
//!
//! Also covers window boundaries, NotFound resolution, failure propagation
//! and merge safety across repositories sharing one cache key.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use proptest::prelude::*;
use refcache_core::{
    record_str, Dependencies, FetchError, RawRecord, RefCacheConfig, RefCacheError,
    ReferenceItem, TenancyScope,
};
use refcache_storage::{
    BulkFetcher, CacheStore, InMemoryCacheStore, ReferenceRepository, ReferenceSource,
};
use refcache_test_utils::{fixtures, generators, init_test_tracing, MockFetcher};
use serde_json::{json, Value};

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn project_source(fetcher: Arc<MockFetcher>) -> ReferenceSource<Value> {
    ReferenceSource::new(
        "project",
        "project_id",
        fetcher as Arc<dyn BulkFetcher>,
        |record: &RawRecord| {
            let name = record_str(record, "name").unwrap_or_default();
            ReferenceItem::new("", name).with_name(name)
        },
    )
}

fn repository(
    store: &Arc<InMemoryCacheStore>,
    fetcher: &Arc<MockFetcher>,
) -> ReferenceRepository<Value> {
    ReferenceRepository::new(
        Arc::clone(store) as Arc<dyn CacheStore>,
        project_source(Arc::clone(fetcher)),
        &TenancyScope::workspace("d-1", "w-1"),
        &Dependencies::new(),
        &fixtures::test_config(),
    )
    .expect("repository")
}

fn paused_runtime() -> Result<tokio::runtime::Runtime, TestCaseError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

// ============================================================================
// SCENARIOS
// ============================================================================

/// 50 rows over 12 distinct projects, 3 of them cached by a previous screen.
#[tokio::test(start_paused = true)]
async fn test_rows_fetch_only_uncached_distinct_ids() {
    init_test_tracing();
    let store = Arc::new(InMemoryCacheStore::default());
    let fetcher = MockFetcher::shared(fixtures::project_records(12));
    let repo = repository(&store, &fetcher);

    for id in ["p-0", "p-1", "p-2"] {
        repo.sync(&json!({"project_id": id, "name": format!("Project {}", &id[2..])}))
            .unwrap();
    }

    let rows: Vec<String> = (0..50).map(|row| format!("p-{}", row % 12)).collect();
    let results = join_all(rows.iter().map(|id| repo.request_item(id))).await;

    for (id, result) in rows.iter().zip(&results) {
        let item = result.as_ref().unwrap().as_ref().unwrap();
        assert_eq!(&item.key, id);
    }

    let requested = fetcher.requested_ids("project_id");
    assert_eq!(requested.len(), 1);
    let sent: HashSet<&str> = requested[0].iter().map(String::as_str).collect();
    assert_eq!(sent.len(), 9);
    assert_eq!(requested[0].len(), 9);
    for cached in ["p-0", "p-1", "p-2"] {
        assert!(!sent.contains(cached));
    }
}

#[tokio::test(start_paused = true)]
async fn test_ids_after_window_go_to_second_fetch() {
    let store = Arc::new(InMemoryCacheStore::default());
    let fetcher = MockFetcher::shared(fixtures::project_records(3));
    let repo = repository(&store, &fetcher);

    let (a, b) = tokio::join!(repo.request_item("p-0"), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        repo.request_item("p-1").await
    });
    assert!(a.unwrap().is_some());
    assert!(b.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(repo.request_item("p-2").await.unwrap().is_some());

    let requested = fetcher.requested_ids("project_id");
    assert_eq!(requested.len(), 2);
    assert_eq!(requested[0].len(), 2);
    assert_eq!(requested[1], vec!["p-2".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_cached_id_resolves_without_waiting() {
    let store = Arc::new(InMemoryCacheStore::default());
    let fetcher = MockFetcher::shared(fixtures::project_records(2));
    let repo = repository(&store, &fetcher);

    repo.request_item("p-0").await.unwrap();
    let before = tokio::time::Instant::now();
    assert!(repo.request_item("p-0").await.unwrap().is_some());

    assert_eq!(tokio::time::Instant::now(), before);
    assert_eq!(fetcher.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_absent_record_resolves_none() {
    let store = Arc::new(InMemoryCacheStore::default());
    let fetcher = MockFetcher::shared(fixtures::project_records(1));
    let repo = repository(&store, &fetcher);

    let (a, b) = tokio::join!(repo.request_item("p-0"), repo.request_item("p-deleted"));
    assert!(a.unwrap().is_some());
    assert_eq!(b.unwrap(), None);
    assert!(repo.cached("p-deleted").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failed_batch_keeps_earlier_entries() {
    let store = Arc::new(InMemoryCacheStore::default());
    let fetcher = MockFetcher::shared(fixtures::project_records(3));
    let repo = repository(&store, &fetcher);
    repo.request_item("p-0").await.unwrap();

    fetcher.fail_with(Some(FetchError::Unauthorized {
        message: "token expired".to_string(),
    }));
    let (a, b) = tokio::join!(repo.request_item("p-1"), repo.request_item("p-2"));
    for result in [a, b] {
        assert!(matches!(result, Err(RefCacheError::BatchFetch { .. })));
    }

    let snapshot = repo.snapshot().unwrap();
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.contains_key("p-0"));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_batches_on_one_key_both_land() {
    let store = Arc::new(InMemoryCacheStore::default());
    let fetcher = MockFetcher::shared(fixtures::project_records(4));
    let first = repository(&store, &fetcher);
    let second = repository(&store, &fetcher);
    assert_eq!(first.key(), second.key());

    let (a, b) = tokio::join!(first.request_item("p-0"), second.request_item("p-3"));
    a.unwrap();
    b.unwrap();

    let merged = first.snapshot().unwrap();
    assert!(merged.contains_key("p-0"));
    assert!(merged.contains_key("p-3"));
}

#[tokio::test(start_paused = true)]
async fn test_slow_fetch_does_not_overlap_next_batch() {
    let store = Arc::new(InMemoryCacheStore::default());
    let fetcher = Arc::new(
        MockFetcher::new(fixtures::project_records(4)).with_latency(Duration::from_secs(2)),
    );
    let repo = repository(&store, &fetcher);

    let (a, b) = tokio::join!(repo.request_item("p-0"), async {
        // Window of the first batch has closed; its fetch is still running.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let started = tokio::time::Instant::now();
        let item = repo.request_item("p-1").await;
        (item, started.elapsed())
    });

    assert!(a.unwrap().is_some());
    let (item, waited) = b;
    assert!(item.unwrap().is_some());
    // Second fetch starts only after the first settled at 2.3s.
    assert!(waited >= Duration::from_millis(1900 + 2000));
    assert_eq!(fetcher.call_count(), 2);
}

#[test]
fn test_config_window_is_used() {
    let config = RefCacheConfig::default().with_batch_window(Duration::from_millis(500));
    let fetcher = MockFetcher::shared(vec![]);
    let repo = ReferenceRepository::new(
        Arc::new(InMemoryCacheStore::default()) as Arc<dyn CacheStore>,
        project_source(fetcher),
        &TenancyScope::root(),
        &Dependencies::new(),
        &config,
    )
    .unwrap();
    assert_eq!(repo.batcher().window(), Duration::from_millis(500));
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_one_fetch_per_window_with_unique_ids(ids in generators::arb_id_requests()) {
        let rt = paused_runtime()?;
        rt.block_on(async {
            let store = Arc::new(InMemoryCacheStore::default());
            let records = ids
                .iter()
                .map(|id| json!({"project_id": id, "name": id}))
                .collect();
            let fetcher = MockFetcher::shared(records);
            let repo = repository(&store, &fetcher);

            let results = join_all(ids.iter().map(|id| repo.request_item(id))).await;

            for (id, result) in ids.iter().zip(results) {
                let item = result
                    .map_err(|e| TestCaseError::fail(e.to_string()))?
                    .ok_or_else(|| TestCaseError::fail(format!("{} unresolved", id)))?;
                prop_assert_eq!(&item.key, id);
                prop_assert_eq!(&item.label, id);
            }

            let requested = fetcher.requested_ids("project_id");
            prop_assert_eq!(requested.len(), 1);
            let distinct: HashSet<&String> = ids.iter().collect();
            prop_assert_eq!(requested[0].len(), distinct.len());
            Ok::<(), TestCaseError>(())
        })?;
    }
}
