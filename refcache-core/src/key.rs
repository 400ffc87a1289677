//! Deterministic, order-independent cache keys.
//!
//! A `CacheKey` can only be built from a tenancy scope, a resource type, a
//! verb and the query params, so two scopes can never share an entry. Params
//! are normalized before encoding: object keys are sorted at every level,
//! array order is kept.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::KeySerializationError;
use crate::{ResourceType, TenancyScope, Verb};

/// Deepest params nesting accepted by the key builder.
pub const MAX_KEY_DEPTH: usize = 32;

/// Marker inserted after the verb for pagination-insensitive keys.
const PAGINATION_MARKER: &str = "pagination";

/// Stable cache key for one logical query.
///
/// # Encoding
///
/// The canonical form is a JSON array:
///
/// ```text
/// [[<scope levels>], "<resource type>", "<verb>", ("pagination",)? <params>?]
/// ```
///
/// Scope comes first so keys sort by tenant. Params are omitted when they
/// serialize to `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    inner: CacheKeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct CacheKeyInner {
    encoded: String,
    scope: TenancyScope,
    resource_type: ResourceType,
    verb: Verb,
}

impl CacheKey {
    /// Build a key for `params` under `scope`.
    ///
    /// Fails when `params` cannot be serialized to JSON (for example a map
    /// with non-string keys) or nests deeper than [`MAX_KEY_DEPTH`].
    pub fn build<P>(
        scope: &TenancyScope,
        resource_type: &ResourceType,
        verb: Verb,
        params: &P,
    ) -> Result<Self, KeySerializationError>
    where
        P: Serialize + ?Sized,
    {
        let params = to_params_value(params)?;
        Self::assemble(scope, resource_type, verb, false, &params)
    }

    /// Build a key that ignores page position.
    ///
    /// `load` params lose their top-level `page`; `list`, `stat` and
    /// `analyze` params lose `query.page`.
    pub fn build_paginated<P>(
        scope: &TenancyScope,
        resource_type: &ResourceType,
        verb: Verb,
        params: &P,
    ) -> Result<Self, KeySerializationError>
    where
        P: Serialize + ?Sized,
    {
        let params = omit_page_params(verb, to_params_value(params)?);
        Self::assemble(scope, resource_type, verb, true, &params)
    }

    fn assemble(
        scope: &TenancyScope,
        resource_type: &ResourceType,
        verb: Verb,
        pagination: bool,
        params: &Value,
    ) -> Result<Self, KeySerializationError> {
        let mut encoded = String::with_capacity(64);
        encoded.push_str("[[");
        for (i, level) in scope.levels().iter().enumerate() {
            if i > 0 {
                encoded.push(',');
            }
            push_json_string(&mut encoded, level);
        }
        encoded.push_str("],");
        push_json_string(&mut encoded, resource_type.as_str());
        encoded.push(',');
        push_json_string(&mut encoded, verb.as_str());
        if pagination {
            encoded.push(',');
            push_json_string(&mut encoded, PAGINATION_MARKER);
        }
        if !params.is_null() {
            encoded.push(',');
            write_canonical(params, 0, &mut encoded)?;
        }
        encoded.push(']');

        Ok(Self {
            inner: CacheKeyInner {
                encoded,
                scope: scope.clone(),
                resource_type: resource_type.clone(),
                verb,
            },
        })
    }

    /// Canonical string form, suitable as a map key.
    pub fn as_str(&self) -> &str {
        &self.inner.encoded
    }

    /// Hex SHA-256 of the canonical form.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.inner.encoded.as_bytes()))
    }

    pub fn scope(&self) -> &TenancyScope {
        &self.inner.scope
    }

    pub fn resource_type(&self) -> &ResourceType {
        &self.inner.resource_type
    }

    pub fn verb(&self) -> Verb {
        self.inner.verb
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.encoded)
    }
}

fn to_params_value<P: Serialize + ?Sized>(params: &P) -> Result<Value, KeySerializationError> {
    serde_json::to_value(params).map_err(|e| KeySerializationError::Unserializable {
        reason: e.to_string(),
    })
}

fn omit_page_params(verb: Verb, mut params: Value) -> Value {
    match verb {
        Verb::Load => {
            if let Some(object) = params.as_object_mut() {
                object.remove("page");
            }
        }
        Verb::List | Verb::Stat | Verb::Analyze => {
            if let Some(query) = params.get_mut("query").and_then(Value::as_object_mut) {
                query.remove("page");
            }
        }
        Verb::Get => {}
    }
    params
}

fn push_json_string(out: &mut String, s: &str) {
    // Display on a JSON string value yields the escaped, quoted literal.
    out.push_str(&Value::String(s.to_string()).to_string());
}

/// Write `value` as JSON with object keys sorted at every level.
fn write_canonical(
    value: &Value,
    depth: usize,
    out: &mut String,
) -> Result<(), KeySerializationError> {
    if depth > MAX_KEY_DEPTH {
        return Err(KeySerializationError::TooDeep {
            max_depth: MAX_KEY_DEPTH,
        });
    }

    match value {
        Value::Object(object) => {
            let mut entries: Vec<(&String, &Value)> = object.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, child)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_json_string(out, key);
                out.push(':');
                write_canonical(child, depth + 1, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, child) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(child, depth + 1, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
    Ok(())
}
