//! Reference data model: a live, scope-aware map for one resource type.
//!
//! A model wires a resource type's fetch settings to the shared store and the
//! session's scope provider. For every (scope, dependencies) combination it
//! touches, it lazily creates a [`ReferenceRepository`] and subscribes to that
//! repository's store entry; store notifications recompute the published map,
//! so readers never refresh by hand.
//!
//! A scope switch yields a new cache key and therefore a new view; views of
//! earlier scopes stay subscribed until [`ReferenceDataModel::dispose`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use refcache_core::{
    CacheKey, Dependencies, RawRecord, RefCacheConfig, RefCacheError, RefCacheResult,
    ReferenceItem, ReferenceMap, ResourceType,
};
use refcache_storage::{
    decode_reference_map, BulkFetcher, CacheStore, LoadOptions, Projector, ReferenceData,
    ReferenceRepository, ReferenceSource, RepositoryStats, ScopeProvider, StoreListener,
    SubscriptionId, Versioned,
};
use serde_json::Value;
use tokio::sync::watch;

use crate::catalog::{projector_for, ResourceTypeInfo};

/// Shared collaborators of every model in a session.
#[derive(Clone)]
pub struct ReferenceContext {
    pub store: Arc<dyn CacheStore>,
    pub scope_provider: Arc<dyn ScopeProvider>,
    pub config: RefCacheConfig,
}

impl ReferenceContext {
    pub fn new(
        store: Arc<dyn CacheStore>,
        scope_provider: Arc<dyn ScopeProvider>,
        config: RefCacheConfig,
    ) -> Self {
        Self {
            store,
            scope_provider,
            config,
        }
    }
}

type MapSender<T> = Arc<watch::Sender<Arc<ReferenceMap<T>>>>;

/// Publish `map` unless the channel already holds a newer revision.
fn publish<T>(
    sender: &watch::Sender<Arc<ReferenceMap<T>>>,
    published: &AtomicU64,
    revision: u64,
    map: ReferenceMap<T>,
) -> bool {
    sender.send_if_modified(|current| {
        if revision <= published.load(Ordering::Acquire) {
            return false;
        }
        published.store(revision, Ordering::Release);
        *current = Arc::new(map);
        true
    })
}

fn decode_change<T: ReferenceData>(key: &CacheKey, change: &Versioned) -> ReferenceMap<T> {
    change
        .value
        .as_deref()
        .map(|value| decode_reference_map(key, value))
        .unwrap_or_default()
}

struct ScopedView<T> {
    repository: ReferenceRepository<T>,
    sender: MapSender<T>,
    subscription: SubscriptionId,
}

/// Live reference map plus lookups for one resource type.
pub struct ReferenceDataModel<T: ReferenceData = Value> {
    info: ResourceTypeInfo,
    source: ReferenceSource<T>,
    context: ReferenceContext,
    dependencies: Dependencies,
    views: Mutex<HashMap<CacheKey, Arc<ScopedView<T>>>>,
}

impl ReferenceDataModel<Value> {
    /// Model for a built-in resource type with its stock projector.
    pub fn builtin(
        context: &ReferenceContext,
        info: ResourceTypeInfo,
        fetcher: Arc<dyn BulkFetcher>,
    ) -> Self {
        let projector = projector_for(&info);
        Self::new(context, info, fetcher, projector)
    }
}

impl<T: ReferenceData> ReferenceDataModel<T> {
    pub fn new(
        context: &ReferenceContext,
        info: ResourceTypeInfo,
        fetcher: Arc<dyn BulkFetcher>,
        projector: Projector<T>,
    ) -> Self {
        let source = info.source(fetcher, projector);
        Self {
            info,
            source,
            context: context.clone(),
            dependencies: Dependencies::new(),
            views: Mutex::new(HashMap::new()),
        }
    }

    /// Default dependency filters carried by every lookup.
    pub fn with_dependencies(mut self, dependencies: Dependencies) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn info(&self) -> &ResourceTypeInfo {
        &self.info
    }

    pub fn resource_type(&self) -> &ResourceType {
        &self.info.resource_type
    }

    /// Whether the session's grant allows this resource type.
    pub fn permitted(&self) -> bool {
        self.info
            .permits(self.context.scope_provider.grant_scope())
    }

    /// Latest resolved map for the current scope and default dependencies.
    ///
    /// Empty when the session's grant does not allow this resource type.
    pub fn reference_map(&self) -> RefCacheResult<Arc<ReferenceMap<T>>> {
        if !self.permitted() {
            return Ok(Arc::new(ReferenceMap::new()));
        }
        let view = self.view(&self.dependencies)?;
        let map = Arc::clone(&view.sender.borrow());
        Ok(map)
    }

    /// Receiver yielding every recomputed map of the current view.
    pub fn watch(&self) -> RefCacheResult<watch::Receiver<Arc<ReferenceMap<T>>>> {
        if !self.permitted() {
            let (_, receiver) = watch::channel(Arc::new(ReferenceMap::new()));
            return Ok(receiver);
        }
        Ok(self.view(&self.dependencies)?.sender.subscribe())
    }

    /// The resolved item for `id` in the current map, without fetching.
    pub fn get(&self, id: &str) -> RefCacheResult<Option<ReferenceItem<T>>> {
        Ok(self.reference_map()?.get(id).cloned())
    }

    /// Resolve `id`, fetching it when it is not cached yet.
    pub async fn request(&self, id: &str) -> RefCacheResult<Option<ReferenceItem<T>>> {
        self.request_with(id, &Dependencies::new()).await
    }

    /// Resolve `id` under additional dependency filters.
    ///
    /// `dependencies` override defaults of the same name. Each distinct set
    /// of values is cached under its own key.
    pub async fn request_with(
        &self,
        id: &str,
        dependencies: &Dependencies,
    ) -> RefCacheResult<Option<ReferenceItem<T>>> {
        if !self.permitted() {
            tracing::debug!(
                resource_type = %self.info.resource_type,
                id,
                "Lookup skipped; grant does not allow resource type"
            );
            return Ok(None);
        }

        let dependencies = self.merged_dependencies(dependencies);
        let missing = self.info.missing_dependencies(&dependencies);
        if !missing.is_empty() {
            tracing::warn!(
                resource_type = %self.info.resource_type,
                missing = ?missing,
                "Lookup issued without declared dependencies"
            );
        }

        let view = self.view(&dependencies)?;
        view.repository.request_item(id).await
    }

    /// Upsert one raw record into the current view.
    pub fn sync(&self, record: &RawRecord) -> RefCacheResult<Option<ReferenceItem<T>>> {
        if !self.permitted() {
            return Ok(None);
        }
        self.view(&self.dependencies)?.repository.sync(record)
    }

    /// Preload the full list into the current view.
    pub async fn load(&self, options: LoadOptions) -> RefCacheResult<bool> {
        if !self.permitted() {
            return Ok(false);
        }
        let view = self.view(&self.dependencies)?;
        view.repository.load(options).await
    }

    /// Drop the current view's store entry.
    pub fn flush(&self) -> RefCacheResult<()> {
        self.view(&self.dependencies)?.repository.flush()
    }

    /// Counters of the current view's repository.
    pub fn stats(&self) -> RefCacheResult<RepositoryStats> {
        Ok(self.view(&self.dependencies)?.repository.stats())
    }

    /// Unsubscribe every view from the store.
    ///
    /// Idempotent. Later reads open fresh views.
    pub fn dispose(&self) -> RefCacheResult<()> {
        let views: Vec<Arc<ScopedView<T>>> = self
            .views
            .lock()
            .map_err(|_| RefCacheError::LockPoisoned)?
            .drain()
            .map(|(_, view)| view)
            .collect();

        for view in views {
            self.context.store.unsubscribe(view.subscription)?;
        }
        Ok(())
    }

    fn merged_dependencies(&self, extra: &Dependencies) -> Dependencies {
        let mut merged = self.dependencies.clone();
        merged.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    fn view(&self, dependencies: &Dependencies) -> RefCacheResult<Arc<ScopedView<T>>> {
        let scope = self.context.scope_provider.current_scope();
        let key = ReferenceRepository::key_for(&self.source, &scope, dependencies)?;

        let mut views = self
            .views
            .lock()
            .map_err(|_| RefCacheError::LockPoisoned)?;
        if let Some(view) = views.get(&key) {
            return Ok(Arc::clone(view));
        }

        let repository = ReferenceRepository::new(
            Arc::clone(&self.context.store),
            self.source.clone(),
            &scope,
            dependencies,
            &self.context.config,
        )?;
        let (sender, _) = watch::channel(Arc::new(ReferenceMap::new()));
        let sender: MapSender<T> = Arc::new(sender);
        let published = Arc::new(AtomicU64::new(0));

        // Notifications can arrive out of order; only newer revisions land.
        let listener: StoreListener = {
            let sender = Arc::clone(&sender);
            let published = Arc::clone(&published);
            Arc::new(move |key: &CacheKey, change: &Versioned| {
                publish(&sender, &published, change.revision, decode_change(key, change));
            })
        };
        let subscription = self.context.store.subscribe(&key, listener)?;
        // Seed after subscribing so no write slips between the two.
        let current = self.context.store.get_versioned(&key)?;
        publish(
            &sender,
            &published,
            current.revision,
            decode_change(&key, &current),
        );

        tracing::debug!(
            resource_type = %self.info.resource_type,
            key = %key,
            "Reference view opened"
        );
        let view = Arc::new(ScopedView {
            repository,
            sender,
            subscription,
        });
        views.insert(key, Arc::clone(&view));
        Ok(view)
    }
}

impl<T: ReferenceData> Drop for ReferenceDataModel<T> {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            tracing::warn!(
                resource_type = %self.info.resource_type,
                error = %e,
                "Failed to release reference views"
            );
        }
    }
}
