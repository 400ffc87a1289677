//! List query shapes exchanged with bulk fetch functions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One raw record as returned by a list API (a JSON object).
pub type RawRecord = Value;

/// Parent-filter values a lookup must carry, keyed by field name.
///
/// Each distinct set of values is a distinct logical query.
pub type Dependencies = BTreeMap<String, Value>;

/// Filter comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    In,
}

/// Single filter clause, serialized as `{ "k": ..., "v": ..., "o": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    #[serde(rename = "k")]
    pub key: String,
    #[serde(rename = "v")]
    pub value: Value,
    #[serde(rename = "o")]
    pub operator: FilterOperator,
}

impl QueryFilter {
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            operator: FilterOperator::Eq,
        }
    }

    /// `key IN [ids...]`
    pub fn any_of<I, S>(key: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            value: Value::Array(ids.into_iter().map(|id| Value::String(id.into())).collect()),
            operator: FilterOperator::In,
        }
    }

    /// Values of an `in` filter as strings.
    pub fn values(&self) -> Vec<&str> {
        match &self.value {
            Value::Array(values) => values.iter().filter_map(Value::as_str).collect(),
            Value::String(value) => vec![value.as_str()],
            _ => Vec::new(),
        }
    }
}

/// Query handed to a bulk fetch function.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<QueryFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub only: Vec<String>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: QueryFilter) -> Self {
        self.filter.push(filter);
        self
    }

    pub fn with_only<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Fold dependency values into the filter set as `eq` clauses.
    pub fn with_dependencies(mut self, dependencies: &Dependencies) -> Self {
        self.filter.extend(
            dependencies
                .iter()
                .map(|(key, value)| QueryFilter::eq(key.clone(), value.clone())),
        );
        self
    }

    /// The first filter on `key`, if any.
    pub fn filter_on(&self, key: &str) -> Option<&QueryFilter> {
        self.filter.iter().find(|f| f.key == key)
    }
}

/// Response of a list call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListResponse {
    #[serde(default)]
    pub results: Vec<RawRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
}

impl ListResponse {
    pub fn new(results: Vec<RawRecord>) -> Self {
        let total_count = Some(results.len() as u64);
        Self {
            results,
            total_count,
        }
    }
}

/// Look up a field on a raw record.
pub fn record_field<'a>(record: &'a RawRecord, field: &str) -> Option<&'a Value> {
    record.as_object().and_then(|object| object.get(field))
}

/// Look up a string field on a raw record.
pub fn record_str<'a>(record: &'a RawRecord, field: &str) -> Option<&'a str> {
    record_field(record, field).and_then(Value::as_str)
}
