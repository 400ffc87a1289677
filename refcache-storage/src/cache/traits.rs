//! Collaborator contracts: cache store, bulk fetcher and scope provider.
//!
//! These are the seams through which the application plugs its own cache
//! store, transport and session context into the reference cache.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use refcache_core::{
    CacheKey, FetchError, GrantScope, ListQuery, ListResponse, RefCacheResult, TenancyScope,
};
use serde_json::Value;
use uuid::Uuid;

/// A value read from the store with the revision it was current at.
///
/// Revisions grow with every write to the store, across all keys. Of two
/// reads or notifications for one key, the higher revision is the newer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Versioned {
    /// `None` when the entry is absent, removed or expired.
    pub value: Option<Arc<Value>>,
    pub revision: u64,
}

/// Callback invoked after the value at a subscribed key changed.
///
/// Notifications run outside the store's lock, so a listener may observe them
/// out of order; compare revisions to keep the newest.
pub type StoreListener = Arc<dyn Fn(&CacheKey, &Versioned) + Send + Sync>;

/// Handle returned by [`CacheStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared key-value cache store.
///
/// One store is shared by every repository in the application. Implementations
/// must run each `update` closure atomically with respect to other updates of
/// the same store and must notify the listeners of a key after its value
/// changed, outside of any internal lock.
///
/// # Re-entrancy
///
/// `update` closures must not call back into the store.
pub trait CacheStore: Send + Sync {
    /// Current value at `key` with the store revision it was read at.
    fn get_versioned(&self, key: &CacheKey) -> RefCacheResult<Versioned>;

    /// Current value at `key`, or `None` when absent or expired.
    fn get(&self, key: &CacheKey) -> RefCacheResult<Option<Arc<Value>>> {
        Ok(self.get_versioned(key)?.value)
    }

    /// Read-modify-write the value at `key`.
    ///
    /// The closure sees the value current at the time it runs, never an
    /// earlier snapshot. Returning `None` removes the entry.
    fn update(
        &self,
        key: &CacheKey,
        f: &mut dyn FnMut(Option<&Value>) -> Option<Value>,
    ) -> RefCacheResult<()>;

    /// Register `listener` for changes at `key`.
    fn subscribe(&self, key: &CacheKey, listener: StoreListener) -> RefCacheResult<SubscriptionId>;

    /// Remove a listener. Returns whether it was registered.
    fn unsubscribe(&self, id: SubscriptionId) -> RefCacheResult<bool>;

    /// Remove the entry at `key`.
    fn remove(&self, key: &CacheKey) -> RefCacheResult<()> {
        self.update(key, &mut |_| None)
    }
}

/// Bulk list fetch for one resource type.
///
/// Must be a pure read from the cache's point of view; the cache calls it at
/// most once per batch and never retries.
#[async_trait]
pub trait BulkFetcher: Send + Sync {
    async fn list(&self, query: ListQuery) -> Result<ListResponse, FetchError>;
}

/// Adapter turning an async closure into a [`BulkFetcher`].
pub struct FnFetcher<F> {
    f: F,
}

impl<F> FnFetcher<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> BulkFetcher for FnFetcher<F>
where
    F: Fn(ListQuery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ListResponse, FetchError>> + Send,
{
    async fn list(&self, query: ListQuery) -> Result<ListResponse, FetchError> {
        (self.f)(query).await
    }
}

/// Supplies the session's current tenancy context.
///
/// A scope change yields new cache keys; old entries are left untouched.
pub trait ScopeProvider: Send + Sync {
    fn current_scope(&self) -> TenancyScope;

    /// Grant level of the session, `None` before a grant is known.
    fn grant_scope(&self) -> Option<GrantScope> {
        Some(self.current_scope().implied_grant())
    }
}
