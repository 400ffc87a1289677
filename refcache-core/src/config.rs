//! Reference cache configuration.
//!
//! Loaded from environment variables or a TOML file; every field falls back
//! to a default when unset.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Default debounce window for ID batches.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(300);

/// Default lifetime of a cache entry and of a full-list load (3 hours).
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60 * 3);

/// Default upper bound on IDs per outgoing filter.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// Tunables for batching and cache lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefCacheConfig {
    /// Fixed window during which requested IDs join the same batch.
    pub batch_window: Duration,
    /// Lifetime of a cache store entry after its last write.
    pub entry_ttl: Duration,
    /// Minimum interval between two full-list loads of one repository.
    pub load_ttl: Duration,
    /// Maximum number of IDs sent in one fetch.
    pub max_batch_size: usize,
}

impl Default for RefCacheConfig {
    fn default() -> Self {
        Self {
            batch_window: DEFAULT_BATCH_WINDOW,
            entry_ttl: DEFAULT_TTL,
            load_ttl: DEFAULT_TTL,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

/// On-disk form of [`RefCacheConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RefCacheConfigFile {
    batch_window_ms: Option<u64>,
    entry_ttl_secs: Option<u64>,
    load_ttl_secs: Option<u64>,
    max_batch_size: Option<usize>,
}

impl From<RefCacheConfigFile> for RefCacheConfig {
    fn from(file: RefCacheConfigFile) -> Self {
        let defaults = RefCacheConfig::default();
        Self {
            batch_window: file
                .batch_window_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_window),
            entry_ttl: file
                .entry_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.entry_ttl),
            load_ttl: file
                .load_ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.load_ttl),
            max_batch_size: file.max_batch_size.unwrap_or(defaults.max_batch_size),
        }
    }
}

impl RefCacheConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the batch window.
    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window;
        self
    }

    /// Set the entry TTL.
    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    /// Set the full-list load TTL.
    pub fn with_load_ttl(mut self, ttl: Duration) -> Self {
        self.load_ttl = ttl;
        self
    }

    /// Set the max batch size.
    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max;
        self
    }

    /// Create a config from environment variables.
    ///
    /// Environment variables:
    /// - `REFCACHE_BATCH_WINDOW_MS`: batch window in milliseconds (default: 300)
    /// - `REFCACHE_ENTRY_TTL_SECS`: cache entry TTL in seconds (default: 10800)
    /// - `REFCACHE_LOAD_TTL_SECS`: full-list load TTL in seconds (default: 10800)
    /// - `REFCACHE_MAX_BATCH_SIZE`: IDs per fetch (default: 1000)
    ///
    /// Unset or unparsable values fall back to their defaults.
    pub fn from_env() -> Self {
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
        }

        RefCacheConfigFile {
            batch_window_ms: parsed("REFCACHE_BATCH_WINDOW_MS"),
            entry_ttl_secs: parsed("REFCACHE_ENTRY_TTL_SECS"),
            load_ttl_secs: parsed("REFCACHE_LOAD_TTL_SECS"),
            max_batch_size: parsed("REFCACHE_MAX_BATCH_SIZE"),
        }
        .into()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let file: RefCacheConfigFile = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        let config = Self::from(file);
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_window.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "batch_window",
                reason: "must be > 0".to_string(),
            });
        }
        if self.entry_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "entry_ttl",
                reason: "must be > 0".to_string(),
            });
        }
        if self.load_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "load_ttl",
                reason: "must be > 0".to_string(),
            });
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_batch_size",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }
}
