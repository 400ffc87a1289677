//! Reference repository: cache-first lookups for one resource type and scope.
//!
//! A repository owns one cache key (the list query of its resource type,
//! scope and dependencies) and one [`IdBatcher`]. Lookups are answered from
//! the store when possible; misses go through the batcher, whose results are
//! merged back into the store entry with a read-modify-write update, so
//! contributions from concurrent batches are never lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use refcache_core::{
    CacheKey, Dependencies, ListQuery, RawRecord, RefCacheConfig, RefCacheError, RefCacheResult,
    ReferenceItem, ReferenceMap, TenancyScope, Verb,
};
use serde_json::{Map, Value};
use tokio::time::Instant;

use super::batcher::{IdBatcher, MergeSink};
use super::source::{ReferenceData, ReferenceSource};
use super::traits::CacheStore;

/// Options for [`ReferenceRepository::load`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Ignore the load TTL.
    pub force: bool,
    /// Skip the load when the entry already holds items.
    pub lazy: bool,
}

impl LoadOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            lazy: false,
        }
    }

    pub fn lazy() -> Self {
        Self {
            force: false,
            lazy: true,
        }
    }
}

/// Point-in-time repository counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    pub hits: u64,
    pub misses: u64,
    pub batches_issued: u64,
    pub records_merged: u64,
}

impl RepositoryStats {
    /// Fraction of lookups answered from the store.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Cache-first lookups for one (resource type, scope, dependencies) query.
pub struct ReferenceRepository<T> {
    store: Arc<dyn CacheStore>,
    source: ReferenceSource<T>,
    key: CacheKey,
    base_query: ListQuery,
    batcher: IdBatcher<T>,
    load_ttl: Duration,
    last_load: Mutex<Option<Instant>>,
    hits: AtomicU64,
    misses: AtomicU64,
    records_merged: Arc<AtomicU64>,
}

impl<T: ReferenceData> ReferenceRepository<T> {
    pub fn new(
        store: Arc<dyn CacheStore>,
        source: ReferenceSource<T>,
        scope: &TenancyScope,
        dependencies: &Dependencies,
        config: &RefCacheConfig,
    ) -> RefCacheResult<Self> {
        let base_query = Self::base_query(&source, dependencies);
        let key = CacheKey::build(scope, source.resource_type(), Verb::List, &base_query)?;
        let records_merged = Arc::new(AtomicU64::new(0));

        let merge: MergeSink<T> = {
            let store = Arc::clone(&store);
            let key = key.clone();
            let records_merged = Arc::clone(&records_merged);
            Arc::new(move |items: &[(String, ReferenceItem<T>)]| {
                let merged = merge_items(store.as_ref(), &key, items)?;
                records_merged.fetch_add(merged as u64, Ordering::Relaxed);
                Ok(())
            })
        };
        let batcher = IdBatcher::new(
            source.clone(),
            base_query.clone(),
            config.batch_window,
            config.max_batch_size,
            merge,
        );

        Ok(Self {
            store,
            source,
            key,
            base_query,
            batcher,
            load_ttl: config.load_ttl,
            last_load: Mutex::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            records_merged,
        })
    }

    /// Cache key a repository for these inputs would use.
    pub fn key_for(
        source: &ReferenceSource<T>,
        scope: &TenancyScope,
        dependencies: &Dependencies,
    ) -> RefCacheResult<CacheKey> {
        let base_query = Self::base_query(source, dependencies);
        Ok(CacheKey::build(
            scope,
            source.resource_type(),
            Verb::List,
            &base_query,
        )?)
    }

    fn base_query(source: &ReferenceSource<T>, dependencies: &Dependencies) -> ListQuery {
        ListQuery::new()
            .with_only(source.only())
            .with_dependencies(dependencies)
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn source(&self) -> &ReferenceSource<T> {
        &self.source
    }

    pub fn batcher(&self) -> &IdBatcher<T> {
        &self.batcher
    }

    /// The cached item for `id`, without fetching.
    pub fn cached(&self, id: &str) -> RefCacheResult<Option<ReferenceItem<T>>> {
        let Some(value) = self.store.get(&self.key)? else {
            return Ok(None);
        };
        Ok(value
            .get(id)
            .and_then(|stored| decode_item(&self.key, id, stored)))
    }

    /// Resolve `id`: from the store when cached, else through the batcher.
    ///
    /// `Ok(None)` means the backend has no record for `id`.
    pub async fn request_item(&self, id: &str) -> RefCacheResult<Option<ReferenceItem<T>>> {
        if let Some(item) = self.cached(id)? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                resource_type = %self.source.resource_type(),
                id,
                "Reference cache hit"
            );
            return Ok(Some(item));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.batcher.request_item(id).await
    }

    /// Every decodable item currently cached under this repository's key.
    pub fn snapshot(&self) -> RefCacheResult<ReferenceMap<T>> {
        Ok(self
            .store
            .get(&self.key)?
            .map(|value| decode_reference_map(&self.key, &value))
            .unwrap_or_default())
    }

    /// Upsert one raw record, e.g. after it was created or edited elsewhere.
    ///
    /// Returns the projected item, `None` when the record carries no ID.
    pub fn sync(&self, record: &RawRecord) -> RefCacheResult<Option<ReferenceItem<T>>> {
        let Some((id, item)) = self.source.project(record) else {
            tracing::warn!(
                resource_type = %self.source.resource_type(),
                id_key = self.source.id_key(),
                "Synced record has no ID"
            );
            return Ok(None);
        };
        let entry = [(id, item)];
        let merged = merge_items(self.store.as_ref(), &self.key, &entry)?;
        self.records_merged
            .fetch_add(merged as u64, Ordering::Relaxed);
        let [(_, item)] = entry;
        Ok(Some(item))
    }

    /// Fetch the full list and merge every record into the store.
    ///
    /// Returns whether a fetch was issued.
    pub async fn load(&self, options: LoadOptions) -> RefCacheResult<bool> {
        if options.lazy && !self.snapshot()?.is_empty() {
            return Ok(false);
        }
        if !options.force {
            let last_load = *self
                .last_load
                .lock()
                .map_err(|_| RefCacheError::LockPoisoned)?;
            if last_load.is_some_and(|at| at.elapsed() < self.load_ttl) {
                tracing::debug!(
                    resource_type = %self.source.resource_type(),
                    "Full load skipped; previous load still fresh"
                );
                return Ok(false);
            }
        }

        let response = self.source.fetch(self.base_query.clone()).await?;
        let items: Vec<(String, ReferenceItem<T>)> = response
            .results
            .iter()
            .filter_map(|record| self.source.project(record))
            .collect();
        let merged = merge_items(self.store.as_ref(), &self.key, &items)?;
        self.records_merged
            .fetch_add(merged as u64, Ordering::Relaxed);

        *self
            .last_load
            .lock()
            .map_err(|_| RefCacheError::LockPoisoned)? = Some(Instant::now());
        tracing::debug!(
            resource_type = %self.source.resource_type(),
            records = merged,
            "Full load merged"
        );
        Ok(true)
    }

    /// Drop this repository's store entry and forget the last load.
    pub fn flush(&self) -> RefCacheResult<()> {
        self.store.remove(&self.key)?;
        *self
            .last_load
            .lock()
            .map_err(|_| RefCacheError::LockPoisoned)? = None;
        Ok(())
    }

    pub fn stats(&self) -> RepositoryStats {
        RepositoryStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            batches_issued: self.batcher.fetches_issued(),
            records_merged: self.records_merged.load(Ordering::Relaxed),
        }
    }
}

/// Merge items into the entry at `key`, overwriting existing IDs.
///
/// Items are encoded before the update so the closure only touches the
/// snapshot current when it runs. Returns the number of items written.
pub fn merge_items<T: ReferenceData>(
    store: &dyn CacheStore,
    key: &CacheKey,
    items: &[(String, ReferenceItem<T>)],
) -> RefCacheResult<usize> {
    if items.is_empty() {
        return Ok(0);
    }

    let encoded = items
        .iter()
        .map(|(id, item)| {
            serde_json::to_value(item)
                .map(|value| (id.clone(), value))
                .map_err(|e| RefCacheError::Codec {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
        })
        .collect::<RefCacheResult<Vec<_>>>()?;

    store.update(key, &mut |previous| {
        let mut next = match previous {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        for (id, value) in &encoded {
            next.insert(id.clone(), value.clone());
        }
        Some(Value::Object(next))
    })?;
    Ok(encoded.len())
}

/// Decode a stored entry into a map, skipping items that no longer decode.
pub fn decode_reference_map<T: ReferenceData>(key: &CacheKey, value: &Value) -> ReferenceMap<T> {
    let Some(object) = value.as_object() else {
        tracing::warn!(key = %key, "Cache entry is not an object; ignoring");
        return ReferenceMap::new();
    };
    object
        .iter()
        .filter_map(|(id, stored)| decode_item(key, id, stored).map(|item| (id.clone(), item)))
        .collect()
}

fn decode_item<T: ReferenceData>(key: &CacheKey, id: &str, stored: &Value) -> Option<ReferenceItem<T>> {
    match serde_json::from_value::<ReferenceItem<T>>(stored.clone()) {
        Ok(item) => Some(item),
        Err(e) => {
            tracing::warn!(key = %key, id, error = %e, "Cache entry failed to decode");
            None
        }
    }
}
