//! refcache Storage - Cache Store, Batcher and Repository
//!
//! Defines the collaborator contracts (cache store, bulk fetcher, scope
//! provider), an in-memory store, and the batching read-through repository
//! built on top of them.

pub mod cache;

pub use cache::{
    decode_reference_map, merge_items, BatchOutcome, BulkFetcher, CacheStore, FnFetcher, IdBatcher,
    InMemoryCacheStore, LoadOptions, MergeSink, Projector, ReferenceData, ReferenceRepository,
    ReferenceSource, RepositoryStats, ScopeProvider, StoreListener, SubscriptionId, Versioned,
};
