//! refcache Core - Reference Data Types
//!
//! Pure data structures shared by every refcache crate: resolved reference
//! items, tenancy scopes, list queries, cache keys and errors.
//! This crate performs no I/O.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub mod config;
pub mod error;
pub mod key;
pub mod query;
pub mod scope;

pub use config::RefCacheConfig;
pub use error::{ConfigError, FetchError, KeySerializationError, RefCacheError, RefCacheResult};
pub use key::{CacheKey, MAX_KEY_DEPTH};
pub use query::{
    record_field, record_str, Dependencies, FilterOperator, ListQuery, ListResponse, QueryFilter,
    RawRecord,
};
pub use scope::{GrantScope, TenancyScope};

// ============================================================================
// RESOURCE TYPES
// ============================================================================

/// Name of a referenceable resource type (`"user"`, `"project"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceType(String);

impl ResourceType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// API verb a cached query was issued with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Get,
    List,
    Load,
    Stat,
    Analyze,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Load => "load",
            Verb::Stat => "stat",
            Verb::Analyze => "analyze",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// REFERENCE ITEMS
// ============================================================================

/// Resolved, display-ready representation of one entity.
///
/// `key` always equals the ID the item was requested by. `data` carries the
/// resource-specific payload; fields added by cross-reference joins live only
/// on the joined copy handed to readers and are never written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceItem<T = serde_json::Value> {
    pub key: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ReferenceItem<T> {
    pub fn new(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            name: None,
            data: None,
        }
    }

    /// Placeholder for an ID that did not resolve: the ID is its own label.
    pub fn fallback(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_data(mut self, data: T) -> Self {
        self.data = Some(data);
        self
    }

    /// Replace the payload, keeping key, label and name.
    pub fn map_data<U>(self, f: impl FnOnce(Option<T>) -> Option<U>) -> ReferenceItem<U> {
        ReferenceItem {
            key: self.key,
            label: self.label,
            name: self.name,
            data: f(self.data),
        }
    }
}

/// Map from reference key to its resolved item.
pub type ReferenceMap<T = serde_json::Value> = HashMap<String, ReferenceItem<T>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_item_builder() {
        let item: ReferenceItem<u32> = ReferenceItem::new("u-1", "u-1 (Ada)")
            .with_name("Ada")
            .with_data(7);
        assert_eq!(item.key, "u-1");
        assert_eq!(item.label, "u-1 (Ada)");
        assert_eq!(item.name.as_deref(), Some("Ada"));
        assert_eq!(item.data, Some(7));
    }

    #[test]
    fn test_fallback_uses_id_as_label() {
        let item: ReferenceItem = ReferenceItem::fallback("project-9");
        assert_eq!(item.key, "project-9");
        assert_eq!(item.label, "project-9");
        assert!(item.name.is_none());
        assert!(item.data.is_none());
    }

    #[test]
    fn test_reference_item_serde_omits_absent_fields() {
        let item: ReferenceItem = ReferenceItem::new("r-1", "Role");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json, serde_json::json!({"key": "r-1", "label": "Role"}));

        let back: ReferenceItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_payload_without_default_decodes() {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct RoleData {
            role_type: String,
        }

        fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> ReferenceItem<T> {
            serde_json::from_value(value).unwrap()
        }

        let bare: ReferenceItem<RoleData> =
            decode(serde_json::json!({"key": "r-1", "label": "Admin"}));
        assert!(bare.data.is_none());

        let full: ReferenceItem<RoleData> = decode(serde_json::json!({
            "key": "r-1",
            "label": "Admin",
            "data": {"role_type": "DOMAIN_ADMIN"}
        }));
        assert_eq!(full.data.unwrap().role_type, "DOMAIN_ADMIN");
    }

    #[test]
    fn test_map_data() {
        let item = ReferenceItem::new("p-1", "Alpha").with_data(2u8);
        let mapped = item.map_data(|d| d.map(|n| n as u32 * 10));
        assert_eq!(mapped.data, Some(20u32));
        assert_eq!(mapped.label, "Alpha");
    }

    #[test]
    fn test_verb_serde_lowercase() {
        assert_eq!(serde_json::to_value(Verb::Analyze).unwrap(), "analyze");
        assert_eq!(Verb::List.to_string(), "list");
    }

    #[test]
    fn test_resource_type_transparent() {
        let rt = ResourceType::from("workspace");
        assert_eq!(serde_json::to_value(&rt).unwrap(), "workspace");
        assert_eq!(rt.as_str(), "workspace");
    }
}
