//! In-memory cache store with TTL expiry and change notification.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use refcache_core::{CacheKey, RefCacheConfig, RefCacheError, RefCacheResult};
use serde_json::Value;

use super::traits::{CacheStore, StoreListener, SubscriptionId, Versioned};

#[derive(Debug, Clone)]
struct StoreEntry {
    value: Arc<Value>,
    written_at: DateTime<Utc>,
}

/// Process-local [`CacheStore`].
///
/// Entries expire `entry_ttl` after their last write: expired entries read as
/// absent and are dropped by [`InMemoryCacheStore::collect_garbage`].
pub struct InMemoryCacheStore {
    entries: RwLock<HashMap<CacheKey, StoreEntry>>,
    /// Bumped only while `entries` is write-locked.
    revision: AtomicU64,
    listeners: RwLock<HashMap<SubscriptionId, (CacheKey, StoreListener)>>,
    entry_ttl: Duration,
}

impl InMemoryCacheStore {
    /// Create a store whose entries live for `entry_ttl`.
    pub fn new(entry_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            revision: AtomicU64::new(0),
            listeners: RwLock::new(HashMap::new()),
            entry_ttl,
        }
    }

    /// Create a store using the configured entry TTL.
    pub fn from_config(config: &RefCacheConfig) -> Self {
        Self::new(config.entry_ttl)
    }

    pub fn entry_ttl(&self) -> Duration {
        self.entry_ttl
    }

    fn is_expired(&self, entry: &StoreEntry, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.written_at)
            .to_std()
            .map(|age| age > self.entry_ttl)
            .unwrap_or(false)
    }

    /// Number of live entries.
    pub fn len(&self) -> RefCacheResult<usize> {
        let now = Utc::now();
        let entries = self.entries.read().map_err(|_| RefCacheError::LockPoisoned)?;
        Ok(entries.values().filter(|e| !self.is_expired(e, now)).count())
    }

    pub fn is_empty(&self) -> RefCacheResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop expired entries, notifying their listeners. Returns the count.
    pub fn collect_garbage(&self) -> RefCacheResult<usize> {
        let now = Utc::now();
        let expired: Vec<(CacheKey, u64)> = {
            let mut entries = self.entries.write().map_err(|_| RefCacheError::LockPoisoned)?;
            let keys: Vec<CacheKey> = entries
                .iter()
                .filter(|(_, entry)| self.is_expired(entry, now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .map(|key| {
                    entries.remove(&key);
                    (key, self.next_revision())
                })
                .collect()
        };

        for (key, revision) in &expired {
            tracing::debug!(key = %key, revision, "Expired cache entry collected");
            self.notify(
                key,
                &Versioned {
                    value: None,
                    revision: *revision,
                },
            )?;
        }
        Ok(expired.len())
    }

    /// Drop every entry without notifying.
    pub fn clear(&self) -> RefCacheResult<()> {
        let mut entries = self.entries.write().map_err(|_| RefCacheError::LockPoisoned)?;
        entries.clear();
        self.next_revision();
        Ok(())
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> RefCacheResult<usize> {
        Ok(self
            .listeners
            .read()
            .map_err(|_| RefCacheError::LockPoisoned)?
            .len())
    }

    /// Current store revision.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, key: &CacheKey, change: &Versioned) -> RefCacheResult<()> {
        // Snapshot so listeners run without holding the lock.
        let listeners: Vec<StoreListener> = self
            .listeners
            .read()
            .map_err(|_| RefCacheError::LockPoisoned)?
            .values()
            .filter(|(subscribed, _)| subscribed == key)
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(key, change);
        }
        Ok(())
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new(refcache_core::config::DEFAULT_TTL)
    }
}

impl CacheStore for InMemoryCacheStore {
    fn get_versioned(&self, key: &CacheKey) -> RefCacheResult<Versioned> {
        let entries = self.entries.read().map_err(|_| RefCacheError::LockPoisoned)?;
        let now = Utc::now();
        Ok(Versioned {
            value: entries
                .get(key)
                .filter(|entry| !self.is_expired(entry, now))
                .map(|entry| Arc::clone(&entry.value)),
            revision: self.revision(),
        })
    }

    fn update(
        &self,
        key: &CacheKey,
        f: &mut dyn FnMut(Option<&Value>) -> Option<Value>,
    ) -> RefCacheResult<()> {
        let change = {
            let mut entries = self.entries.write().map_err(|_| RefCacheError::LockPoisoned)?;
            let now = Utc::now();
            let previous = entries
                .get(key)
                .filter(|entry| !self.is_expired(entry, now))
                .map(|entry| Arc::clone(&entry.value));

            match f(previous.as_deref()) {
                Some(next) => {
                    let changed = previous.as_deref() != Some(&next);
                    let value = Arc::new(next);
                    entries.insert(
                        key.clone(),
                        StoreEntry {
                            value: Arc::clone(&value),
                            written_at: now,
                        },
                    );
                    changed.then(|| Versioned {
                        value: Some(value),
                        revision: self.next_revision(),
                    })
                }
                None => entries.remove(key).is_some().then(|| Versioned {
                    value: None,
                    revision: self.next_revision(),
                }),
            }
        };

        if let Some(change) = change {
            self.notify(key, &change)?;
        }
        Ok(())
    }

    fn subscribe(&self, key: &CacheKey, listener: StoreListener) -> RefCacheResult<SubscriptionId> {
        let id = SubscriptionId::new();
        self.listeners
            .write()
            .map_err(|_| RefCacheError::LockPoisoned)?
            .insert(id, (key.clone(), listener));
        tracing::debug!(key = %key, subscription = %id, "Store listener added");
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> RefCacheResult<bool> {
        let removed = self
            .listeners
            .write()
            .map_err(|_| RefCacheError::LockPoisoned)?
            .remove(&id)
            .is_some();
        if removed {
            tracing::debug!(subscription = %id, "Store listener removed");
        }
        Ok(removed)
    }
}
