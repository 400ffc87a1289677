//! Error types for reference cache operations

use crate::ResourceType;
use thiserror::Error;

/// Cache key construction errors.
///
/// These are programmer errors: the params handed to the key builder cannot
/// be turned into a stable canonical form.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeySerializationError {
    #[error("Params cannot be serialized into a cache key: {reason}")]
    Unserializable { reason: String },

    #[error("Params nest deeper than {max_depth} levels")]
    TooDeep { max_depth: usize },
}

/// Errors reported by an injected bulk fetch function.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Invalid query: {message}")]
    InvalidQuery { message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },
}

impl FetchError {
    /// Whether a caller may reasonably retry the same request.
    ///
    /// The cache itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for the reference cache.
///
/// A missing record is not an error: lookups resolve to `Ok(None)`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefCacheError {
    #[error("Key error: {0}")]
    KeySerialization(#[from] KeySerializationError),

    #[error("Batch fetch for {resource_type} failed: {source}")]
    BatchFetch {
        resource_type: ResourceType,
        #[source]
        source: FetchError,
    },

    #[error("Cache entry {key} could not be encoded: {reason}")]
    Codec { key: String, reason: String },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Batch for {resource_type} was dropped before it settled")]
    BatcherClosed { resource_type: ResourceType },
}

impl RefCacheError {
    /// The fetch failure behind this error, if any.
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            Self::BatchFetch { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type alias for reference cache operations.
pub type RefCacheResult<T> = Result<T, RefCacheError>;

// =============================================================================
// TESTS
// =============================================================================
