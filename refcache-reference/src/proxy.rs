//! Cross-reference proxy: joins reference models on every read.
//!
//! A proxy wraps one base model and an ordered chain of joined models. It
//! keeps only weak handles to all of them, so it never keeps a model alive,
//! and it caches nothing: each [`CrossReferenceProxy::get`] reads the current
//! maps and recomputes the chain. Every join sees the item produced by the
//! previous one, so `user -> role -> X` chains can build on joined fields.
//! Joined fields exist only on the returned copy and are never written back
//! to the store.

use std::sync::{Arc, Weak};

use refcache_core::{ReferenceItem, ReferenceMap};
use refcache_storage::ReferenceData;
use serde_json::Value;

use crate::model::ReferenceDataModel;

/// Computes a joined item from a base item and the joined model's map.
///
/// Returns `None` when the join cannot be made yet; the item is then passed
/// on unchanged.
pub type JoinResolver<B, J> =
    Arc<dyn Fn(&ReferenceItem<B>, &str, &ReferenceMap<J>) -> Option<ReferenceItem<B>> + Send + Sync>;

/// Join bound to the joined map current at one read.
type PreparedJoin<B> = Box<dyn Fn(ReferenceItem<B>, &str) -> ReferenceItem<B>>;

/// One link of the join chain, erased over the joined model's payload type.
trait JoinStep<B>: Send + Sync {
    /// `None` when the joined model is gone or its map is unavailable.
    fn prepare(&self) -> Option<PreparedJoin<B>>;
}

struct ModelJoin<B: ReferenceData, J: ReferenceData> {
    joined: Weak<ReferenceDataModel<J>>,
    resolver: JoinResolver<B, J>,
}

impl<B: ReferenceData, J: ReferenceData> JoinStep<B> for ModelJoin<B, J> {
    fn prepare(&self) -> Option<PreparedJoin<B>> {
        let joined = self.joined.upgrade()?;
        let map = match joined.reference_map() {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(
                    resource_type = %joined.resource_type(),
                    error = %e,
                    "Joined reference map unavailable"
                );
                return None;
            }
        };
        let resolver = Arc::clone(&self.resolver);
        Some(Box::new(move |item: ReferenceItem<B>, id: &str| {
            resolver(&item, id, &*map).unwrap_or(item)
        }))
    }
}

/// Lazily joined view over a base model.
pub struct CrossReferenceProxy<B: ReferenceData = Value> {
    base: Weak<ReferenceDataModel<B>>,
    steps: Vec<Arc<dyn JoinStep<B>>>,
}

impl<B: ReferenceData> Clone for CrossReferenceProxy<B> {
    fn clone(&self) -> Self {
        Self {
            base: Weak::clone(&self.base),
            steps: self.steps.clone(),
        }
    }
}

impl<B: ReferenceData> CrossReferenceProxy<B> {
    /// Proxy joining `base` with `joined`.
    pub fn new<J, F>(
        base: &Arc<ReferenceDataModel<B>>,
        joined: &Arc<ReferenceDataModel<J>>,
        resolver: F,
    ) -> Self
    where
        J: ReferenceData,
        F: Fn(&ReferenceItem<B>, &str, &ReferenceMap<J>) -> Option<ReferenceItem<B>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            base: Arc::downgrade(base),
            steps: Vec::new(),
        }
        .then_join(joined, resolver)
    }

    /// Append another join; it runs on the output of the previous ones.
    pub fn then_join<J, F>(mut self, joined: &Arc<ReferenceDataModel<J>>, resolver: F) -> Self
    where
        J: ReferenceData,
        F: Fn(&ReferenceItem<B>, &str, &ReferenceMap<J>) -> Option<ReferenceItem<B>>
            + Send
            + Sync
            + 'static,
    {
        self.steps.push(Arc::new(ModelJoin {
            joined: Arc::downgrade(joined),
            resolver: Arc::new(resolver),
        }));
        self
    }

    /// Number of joined models.
    pub fn join_count(&self) -> usize {
        self.steps.len()
    }

    /// Joined item for `id`.
    ///
    /// `None` when the base model has no entry (or is gone). Joins whose model
    /// is gone or not resolved yet are skipped. Never fetches.
    pub fn get(&self, id: &str) -> Option<ReferenceItem<B>> {
        let base = self.base.upgrade()?;
        let item = match base.get(id) {
            Ok(item) => item?,
            Err(e) => {
                tracing::warn!(
                    resource_type = %base.resource_type(),
                    error = %e,
                    "Base reference map unavailable"
                );
                return None;
            }
        };
        let joins = self.prepare();
        Some(Self::apply(&joins, item, id))
    }

    /// Every base entry with the joins applied.
    pub fn entries(&self) -> ReferenceMap<B> {
        let Some(base) = self.base.upgrade() else {
            return ReferenceMap::new();
        };
        let base_map = match base.reference_map() {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(
                    resource_type = %base.resource_type(),
                    error = %e,
                    "Base reference map unavailable"
                );
                return ReferenceMap::new();
            }
        };
        let joins = self.prepare();
        base_map
            .iter()
            .map(|(id, item)| (id.clone(), Self::apply(&joins, item.clone(), id)))
            .collect()
    }

    fn prepare(&self) -> Vec<PreparedJoin<B>> {
        self.steps.iter().filter_map(|step| step.prepare()).collect()
    }

    fn apply(joins: &[PreparedJoin<B>], item: ReferenceItem<B>, id: &str) -> ReferenceItem<B> {
        joins.iter().fold(item, |item, join| join(item, id))
    }
}
