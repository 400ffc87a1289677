//! ID batcher: coalesces single-ID lookups into bulk list calls.
//!
//! The first request after the batcher went idle opens a batch and starts a
//! fixed window timer. Every request that arrives before the timer fires joins
//! that batch; repeated IDs share one slot. When the window closes the batch
//! is taken out of the accumulating slot, so later requests open a new batch,
//! and its IDs are sent as one `id IN [...]` filter. Above `max_batch_size`
//! the filter is split into sequential calls that still settle as one batch:
//! results are merged only once every call succeeded.
//!
//! Fetches of one batcher never overlap: a batch whose window closed while
//! the previous one is still in flight waits for it to settle.
//!
//! Results are handed to the merge sink before any waiter is woken, so a
//! caller that resolves always finds its item in the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use refcache_core::{ListQuery, QueryFilter, RefCacheError, RefCacheResult, ReferenceItem};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::source::{ReferenceData, ReferenceSource};

/// Result delivered to one waiter: the item, `None` when not found.
pub type BatchOutcome<T> = RefCacheResult<Option<ReferenceItem<T>>>;

/// Receives the items of a settled fetch before waiters are woken.
pub type MergeSink<T> =
    Arc<dyn Fn(&[(String, ReferenceItem<T>)]) -> RefCacheResult<()> + Send + Sync>;

struct PendingBatch<T> {
    id: u64,
    /// Distinct IDs in arrival order.
    ids: Vec<String>,
    waiters: HashMap<String, Vec<oneshot::Sender<BatchOutcome<T>>>>,
    timer: Option<JoinHandle<()>>,
}

impl<T> PendingBatch<T> {
    fn abandoned(&self) -> bool {
        self.waiters
            .values()
            .flatten()
            .all(oneshot::Sender::is_closed)
    }
}

struct BatcherState<T> {
    accumulating: Option<PendingBatch<T>>,
    next_batch_id: u64,
}

struct BatcherInner<T> {
    source: ReferenceSource<T>,
    base_query: ListQuery,
    window: Duration,
    max_batch_size: usize,
    merge: MergeSink<T>,
    state: Mutex<BatcherState<T>>,
    flight: tokio::sync::Mutex<()>,
    fetches_issued: AtomicU64,
}

/// Coalesces lookups for one (resource type, scope, dependencies) query.
pub struct IdBatcher<T> {
    inner: Arc<BatcherInner<T>>,
}

impl<T> Clone for IdBatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ReferenceData> IdBatcher<T> {
    /// Create a batcher.
    ///
    /// `base_query` carries the field projection and dependency filters; the
    /// ID filter is appended per fetch. `max_batch_size` is clamped to 1.
    pub fn new(
        source: ReferenceSource<T>,
        base_query: ListQuery,
        window: Duration,
        max_batch_size: usize,
        merge: MergeSink<T>,
    ) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                source,
                base_query,
                window,
                max_batch_size: max_batch_size.max(1),
                merge,
                state: Mutex::new(BatcherState {
                    accumulating: None,
                    next_batch_id: 0,
                }),
                flight: tokio::sync::Mutex::new(()),
                fetches_issued: AtomicU64::new(0),
            }),
        }
    }

    /// Resolve `id` through the next batch.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn request_item(&self, id: &str) -> BatchOutcome<T> {
        let receiver = self.enqueue(id)?;
        receiver
            .await
            .map_err(|_| RefCacheError::BatcherClosed {
                resource_type: self.inner.source.resource_type().clone(),
            })?
    }

    fn enqueue(&self, id: &str) -> RefCacheResult<oneshot::Receiver<BatchOutcome<T>>> {
        let (sender, receiver) = oneshot::channel();
        let mut state = self
            .inner
            .state
            .lock()
            .map_err(|_| RefCacheError::LockPoisoned)?;

        if state.accumulating.is_none() {
            let batch_id = state.next_batch_id;
            state.next_batch_id += 1;

            let inner = Arc::clone(&self.inner);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(inner.window).await;
                inner.flush(batch_id).await;
            });

            tracing::debug!(
                resource_type = %self.inner.source.resource_type(),
                batch = batch_id,
                window_ms = self.inner.window.as_millis() as u64,
                "Batch opened"
            );
            state.accumulating = Some(PendingBatch {
                id: batch_id,
                ids: Vec::new(),
                waiters: HashMap::new(),
                timer: Some(timer),
            });
        }

        if let Some(batch) = state.accumulating.as_mut() {
            let waiters = batch.waiters.entry(id.to_string()).or_default();
            if waiters.is_empty() {
                batch.ids.push(id.to_string());
            }
            waiters.push(sender);
            tracing::debug!(
                resource_type = %self.inner.source.resource_type(),
                batch = batch.id,
                id,
                ids = batch.ids.len(),
                "ID joined batch"
            );
        }

        Ok(receiver)
    }

    /// Drop the accumulating batch if every caller has gone away.
    ///
    /// A batch with at least one live waiter is left untouched. Returns
    /// whether a batch was cancelled.
    pub fn cancel_abandoned(&self) -> RefCacheResult<bool> {
        let mut state = self
            .inner
            .state
            .lock()
            .map_err(|_| RefCacheError::LockPoisoned)?;

        let abandoned = state
            .accumulating
            .as_ref()
            .is_some_and(PendingBatch::abandoned);
        if !abandoned {
            return Ok(false);
        }

        if let Some(mut batch) = state.accumulating.take() {
            if let Some(timer) = batch.timer.take() {
                timer.abort();
            }
            tracing::debug!(
                resource_type = %self.inner.source.resource_type(),
                batch = batch.id,
                "Abandoned batch cancelled"
            );
        }
        Ok(true)
    }

    /// Number of distinct IDs waiting in the accumulating batch.
    pub fn pending_len(&self) -> RefCacheResult<usize> {
        let state = self
            .inner
            .state
            .lock()
            .map_err(|_| RefCacheError::LockPoisoned)?;
        Ok(state.accumulating.as_ref().map_or(0, |batch| batch.ids.len()))
    }

    /// Number of list calls issued so far.
    pub fn fetches_issued(&self) -> u64 {
        self.inner.fetches_issued.load(Ordering::Relaxed)
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }
}

impl<T: ReferenceData> BatcherInner<T> {
    /// Close the window of batch `batch_id` and settle it.
    async fn flush(&self, batch_id: u64) {
        let batch = match self.state.lock() {
            Ok(mut state) => {
                if state.accumulating.as_ref().map(|b| b.id) != Some(batch_id) {
                    // Cancelled before the timer fired.
                    return;
                }
                state.accumulating.take()
            }
            Err(_) => {
                tracing::warn!(
                    resource_type = %self.source.resource_type(),
                    "Batcher state poisoned; dropping batch"
                );
                return;
            }
        };
        let Some(PendingBatch {
            id, ids, mut waiters, ..
        }) = batch
        else {
            return;
        };

        let _in_flight = self.flight.lock().await;
        tracing::debug!(
            resource_type = %self.source.resource_type(),
            batch = id,
            ids = ids.len(),
            "Batch flushed"
        );

        match self.fetch_all(&ids).await {
            Ok(found) => {
                let mut by_id: HashMap<String, ReferenceItem<T>> = found.into_iter().collect();
                for requested in &ids {
                    let item = by_id.remove(requested);
                    tracing::trace!(
                        resource_type = %self.source.resource_type(),
                        id = %requested,
                        found = item.is_some(),
                        "Reference resolved"
                    );
                    for waiter in waiters.remove(requested).unwrap_or_default() {
                        let _ = waiter.send(Ok(item.clone()));
                    }
                }
            }
            Err(err) => {
                for waiter in waiters.drain().flat_map(|(_, senders)| senders) {
                    let _ = waiter.send(Err(err.clone()));
                }
            }
        }
    }

    /// Fetch every chunk of a batch, then merge the union once.
    ///
    /// Any failed chunk fails the batch: nothing is merged and later chunks
    /// are not fetched.
    async fn fetch_all(&self, ids: &[String]) -> RefCacheResult<Vec<(String, ReferenceItem<T>)>> {
        let mut found = Vec::new();
        for chunk in ids.chunks(self.max_batch_size) {
            let query = self
                .base_query
                .clone()
                .with_filter(QueryFilter::any_of(self.source.id_key(), chunk.iter().cloned()));
            self.fetches_issued.fetch_add(1, Ordering::Relaxed);

            let response = self.source.fetch(query).await?;
            found.extend(
                response
                    .results
                    .iter()
                    .filter_map(|record| self.source.project(record)),
            );
        }
        (self.merge)(&found)?;
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::traits::{BulkFetcher, FnFetcher};
    use refcache_core::{record_str, FetchError, ListResponse, RawRecord};
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicBool;

    type Calls = Arc<Mutex<Vec<Vec<String>>>>;

    /// Fetcher that answers with one record per requested ID, except `missing-*`.
    ///
    /// Calls carrying a `broken-*` ID fail.
    fn recording_fetcher(calls: Calls, fail: Arc<AtomicBool>) -> Arc<dyn BulkFetcher> {
        Arc::new(FnFetcher::new(move |query: ListQuery| {
            let calls = Arc::clone(&calls);
            let fail = Arc::clone(&fail);
            async move {
                let ids: Vec<String> = query
                    .filter_on("user_id")
                    .map(|f| f.values().into_iter().map(str::to_string).collect())
                    .unwrap_or_default();
                calls.lock().unwrap().push(ids.clone());
                if fail.load(Ordering::SeqCst) || ids.iter().any(|id| id.starts_with("broken")) {
                    return Err(FetchError::Network {
                        message: "connection reset".to_string(),
                    });
                }
                let results = ids
                    .iter()
                    .filter(|id| !id.starts_with("missing"))
                    .map(|id| json!({"user_id": id, "name": format!("name of {id}")}))
                    .collect();
                Ok(ListResponse::new(results))
            }
        }))
    }

    fn source(fetcher: Arc<dyn BulkFetcher>) -> ReferenceSource<Value> {
        ReferenceSource::new("user", "user_id", fetcher, |record: &RawRecord| {
            let name = record_str(record, "name").unwrap_or_default();
            ReferenceItem::new("", name).with_name(name)
        })
    }

    struct Harness {
        batcher: IdBatcher<Value>,
        calls: Calls,
        fail: Arc<AtomicBool>,
        merged: Arc<Mutex<Vec<String>>>,
    }

    fn harness(max_batch_size: usize) -> Harness {
        let calls: Calls = Arc::default();
        let fail = Arc::new(AtomicBool::new(false));
        let merged: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink_log = Arc::clone(&merged);
        let sink: MergeSink<Value> = Arc::new(move |items: &[(String, ReferenceItem<Value>)]| {
            sink_log
                .lock()
                .unwrap()
                .extend(items.iter().map(|(id, _)| id.clone()));
            Ok(())
        });
        let batcher = IdBatcher::new(
            source(recording_fetcher(Arc::clone(&calls), Arc::clone(&fail))),
            ListQuery::new(),
            Duration::from_millis(300),
            max_batch_size,
            sink,
        );
        Harness {
            batcher,
            calls,
            fail,
            merged,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_ids_share_one_slot() {
        let h = harness(1000);
        let (a, b, c) = tokio::join!(
            h.batcher.request_item("u-1"),
            h.batcher.request_item("u-1"),
            h.batcher.request_item("u-1"),
        );

        let a = a.unwrap().unwrap();
        assert_eq!(a.key, "u-1");
        assert_eq!(b.unwrap().unwrap(), a);
        assert_eq!(c.unwrap().unwrap(), a);
        assert_eq!(*h.calls.lock().unwrap(), vec![vec!["u-1".to_string()]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_id_resolves_none() {
        let h = harness(1000);
        let (found, missing) = tokio::join!(
            h.batcher.request_item("u-1"),
            h.batcher.request_item("missing-2"),
        );

        assert_eq!(found.unwrap().unwrap().label, "name of u-1");
        assert_eq!(missing.unwrap(), None);
        assert_eq!(h.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_rejects_every_waiter_and_skips_merge() {
        let h = harness(1000);
        h.fail.store(true, Ordering::SeqCst);

        let (a, b) = tokio::join!(h.batcher.request_item("u-1"), h.batcher.request_item("u-2"));

        for result in [a, b] {
            let err = result.unwrap_err();
            assert!(matches!(
                err.fetch_error(),
                Some(FetchError::Network { .. })
            ));
        }
        assert!(h.merged.lock().unwrap().is_empty());

        // The next request starts a fresh batch.
        h.fail.store(false, Ordering::SeqCst);
        assert!(h.batcher.request_item("u-3").await.unwrap().is_some());
        assert_eq!(h.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_does_not_slide() {
        let h = harness(1000);
        let batcher = h.batcher.clone();
        let first = tokio::spawn(async move { batcher.request_item("u-1").await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let batcher = h.batcher.clone();
        let second = tokio::spawn(async move { batcher.request_item("u-2").await });

        // 300ms after the first request, not after the second.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.calls.lock().unwrap().len(), 1);
        assert_eq!(h.batcher.pending_len().unwrap(), 0);

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(h.calls.lock().unwrap()[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_batches_are_chunked() {
        let h = harness(2);
        let results = futures_util::future::join_all(
            ["u-1", "u-2", "u-3", "u-4", "u-5"]
                .iter()
                .map(|id| h.batcher.request_item(id)),
        )
        .await;

        assert!(results.iter().all(|r| matches!(r, Ok(Some(_)))));
        let calls = h.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], vec!["u-5".to_string()]);
        assert_eq!(h.batcher.fetches_issued(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_fails_whole_batch() {
        let h = harness(2);
        let results = futures_util::future::join_all(
            ["u-1", "u-2", "broken-3"]
                .iter()
                .map(|id| h.batcher.request_item(id)),
        )
        .await;

        assert_eq!(h.calls.lock().unwrap().len(), 2);
        for result in &results {
            assert!(matches!(
                result.as_ref().unwrap_err().fetch_error(),
                Some(FetchError::Network { .. })
            ));
        }
        // The first chunk succeeded but its items were not merged.
        assert!(h.merged.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_runs_before_waiters_resolve() {
        let h = harness(1000);
        h.batcher.request_item("u-9").await.unwrap();
        assert_eq!(*h.merged.lock().unwrap(), vec!["u-9".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandoned() {
        let h = harness(1000);

        // A live waiter keeps the batch.
        let batcher = h.batcher.clone();
        let live = tokio::spawn(async move { batcher.request_item("u-1").await });
        tokio::task::yield_now().await;
        assert!(!h.batcher.cancel_abandoned().unwrap());
        live.await.unwrap().unwrap();

        // A dropped waiter leaves nothing to serve.
        let batcher = h.batcher.clone();
        let gone = tokio::spawn(async move { batcher.request_item("u-2").await });
        tokio::task::yield_now().await;
        gone.abort();
        let _ = gone.await;

        assert!(h.batcher.cancel_abandoned().unwrap());
        assert_eq!(h.batcher.pending_len().unwrap(), 0);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.calls.lock().unwrap().len(), 1);
    }
}
