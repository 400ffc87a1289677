//! Read-through reference cache with request coalescing.
//!
//! Lookups flow leaf to root through three layers:
//!
//! - [`ReferenceRepository`] answers from the shared [`CacheStore`] when the
//!   entry for its cache key already holds the requested ID.
//! - Misses go to the repository's [`IdBatcher`], which collects IDs over a
//!   fixed window and issues one bulk list call per window.
//! - Results are merged back into the store with a read-modify-write update,
//!   and store listeners see the enriched entry.
//!
//! # Example
//!
//! ```ignore
//! let repo = ReferenceRepository::new(store, source, &scope, &Dependencies::new(), &config)?;
//!
//! // Both lookups land in the same bulk fetch.
//! let (alpha, beta) = tokio::join!(repo.request_item("p-1"), repo.request_item("p-2"));
//!
//! // A missing record is `Ok(None)`, not an error.
//! if alpha?.is_none() {
//!     render_fallback("p-1");
//! }
//! ```

pub mod batcher;
pub mod memory;
pub mod repository;
pub mod source;
pub mod traits;

pub use batcher::{BatchOutcome, IdBatcher, MergeSink};
pub use memory::InMemoryCacheStore;
pub use repository::{
    decode_reference_map, merge_items, LoadOptions, ReferenceRepository, RepositoryStats,
};
pub use source::{Projector, ReferenceData, ReferenceSource};
pub use traits::{
    BulkFetcher, CacheStore, FnFetcher, ScopeProvider, StoreListener, SubscriptionId, Versioned,
};
