//! Per-resource-type fetch and projection settings.

use std::fmt;
use std::sync::Arc;

use refcache_core::{
    record_field, ListQuery, ListResponse, RawRecord, RefCacheError, RefCacheResult,
    ReferenceItem, ResourceType,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::traits::BulkFetcher;

/// Payload types a reference item can carry through the cache store.
pub trait ReferenceData: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> ReferenceData for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Turns one raw record into a display-ready item.
pub type Projector<T> = Arc<dyn Fn(&RawRecord) -> ReferenceItem<T> + Send + Sync>;

/// Everything needed to fetch and project one resource type.
pub struct ReferenceSource<T> {
    resource_type: ResourceType,
    id_key: String,
    only: Vec<String>,
    fetcher: Arc<dyn BulkFetcher>,
    projector: Projector<T>,
}

impl<T> Clone for ReferenceSource<T> {
    fn clone(&self) -> Self {
        Self {
            resource_type: self.resource_type.clone(),
            id_key: self.id_key.clone(),
            only: self.only.clone(),
            fetcher: Arc::clone(&self.fetcher),
            projector: Arc::clone(&self.projector),
        }
    }
}

impl<T> fmt::Debug for ReferenceSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceSource")
            .field("resource_type", &self.resource_type)
            .field("id_key", &self.id_key)
            .field("only", &self.only)
            .finish_non_exhaustive()
    }
}

impl<T> ReferenceSource<T> {
    pub fn new<P>(
        resource_type: impl Into<ResourceType>,
        id_key: impl Into<String>,
        fetcher: Arc<dyn BulkFetcher>,
        projector: P,
    ) -> Self
    where
        P: Fn(&RawRecord) -> ReferenceItem<T> + Send + Sync + 'static,
    {
        Self {
            resource_type: resource_type.into(),
            id_key: id_key.into(),
            only: Vec::new(),
            fetcher,
            projector: Arc::new(projector),
        }
    }

    /// Like [`ReferenceSource::new`], for an already shared projector.
    pub fn from_projector(
        resource_type: impl Into<ResourceType>,
        id_key: impl Into<String>,
        fetcher: Arc<dyn BulkFetcher>,
        projector: Projector<T>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            id_key: id_key.into(),
            only: Vec::new(),
            fetcher,
            projector,
        }
    }

    /// Restrict fetched records to these fields.
    pub fn with_only<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn resource_type(&self) -> &ResourceType {
        &self.resource_type
    }

    pub fn id_key(&self) -> &str {
        &self.id_key
    }

    pub fn only(&self) -> &[String] {
        &self.only
    }

    /// Canonical ID of a raw record. Numeric IDs are rendered as strings.
    pub fn record_id(&self, record: &RawRecord) -> Option<String> {
        match record_field(record, &self.id_key)? {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    /// Project a record, forcing the item key to the record's ID.
    pub fn project(&self, record: &RawRecord) -> Option<(String, ReferenceItem<T>)> {
        let id = self.record_id(record)?;
        let mut item = (self.projector)(record);
        item.key = id.clone();
        Some((id, item))
    }

    /// Run one list call, tagging failures with the resource type.
    pub async fn fetch(&self, query: ListQuery) -> RefCacheResult<ListResponse> {
        self.fetcher.list(query).await.map_err(|source| {
            tracing::warn!(
                resource_type = %self.resource_type,
                error = %source,
                "Reference fetch failed"
            );
            RefCacheError::BatchFetch {
                resource_type: self.resource_type.clone(),
                source,
            }
        })
    }
}
