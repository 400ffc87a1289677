//! refcache Test Utilities
//!
//! Centralized test infrastructure for the refcache workspace:
//! - Recording mock fetcher and switchable scope provider
//! - Proptest generators for scopes, IDs and dependencies
//! - Record fixtures for the built-in resource types
//! - Tracing setup for tests

// Re-export core types for convenience
pub use refcache_core::{
    CacheKey, Dependencies, FetchError, FilterOperator, GrantScope, ListQuery, ListResponse,
    QueryFilter, RawRecord, RefCacheConfig, RefCacheError, RefCacheResult, ReferenceItem,
    ReferenceMap, ResourceType, TenancyScope, Verb,
};
pub use refcache_storage::{BulkFetcher, CacheStore, InMemoryCacheStore, ScopeProvider};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

// ============================================================================
// MOCK PROVIDERS
// ============================================================================

/// Mock bulk fetcher serving a fixed record set.
///
/// Honors `in` and `eq` filters, records every query it receives, and can be
/// told to fail or to take a while to answer.
#[derive(Debug, Default)]
pub struct MockFetcher {
    records: Vec<RawRecord>,
    queries: Mutex<Vec<ListQuery>>,
    failure: Mutex<Option<FetchError>>,
    latency: Option<Duration>,
}

impl MockFetcher {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    /// Wrap in an `Arc` for sharing with a repository.
    pub fn shared(records: Vec<RawRecord>) -> Arc<Self> {
        Arc::new(Self::new(records))
    }

    /// Answer every call after `latency` of (tokio) time.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail every following call with `error`; `None` restores success.
    pub fn fail_with(&self, error: Option<FetchError>) {
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Every query received so far.
    pub fn queries(&self) -> Vec<ListQuery> {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.queries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Values of the `in` filter on `key` of every query, in call order.
    pub fn requested_ids(&self, key: &str) -> Vec<Vec<String>> {
        self.queries()
            .iter()
            .map(|query| {
                query
                    .filter_on(key)
                    .map(|filter| filter.values().into_iter().map(str::to_string).collect())
                    .unwrap_or_default()
            })
            .collect()
    }

    fn matches(record: &RawRecord, filter: &QueryFilter) -> bool {
        let Some(field) = refcache_core::record_field(record, &filter.key) else {
            return false;
        };
        match filter.operator {
            FilterOperator::Eq => field == &filter.value,
            FilterOperator::In => {
                let field = match field {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return false,
                };
                filter.values().contains(&field.as_str())
            }
        }
    }
}

#[async_trait]
impl BulkFetcher for MockFetcher {
    async fn list(&self, query: ListQuery) -> Result<ListResponse, FetchError> {
        self.queries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(query.clone());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let failure = self
            .failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(error) = failure {
            return Err(error);
        }

        let results = self
            .records
            .iter()
            .filter(|record| query.filter.iter().all(|f| Self::matches(record, f)))
            .cloned()
            .collect();
        Ok(ListResponse::new(results))
    }
}

/// Scope provider whose scope and grant can be switched mid-test.
#[derive(Debug)]
pub struct MockScopeProvider {
    scope: RwLock<TenancyScope>,
    grant: RwLock<Option<GrantScope>>,
}

impl MockScopeProvider {
    /// Provider for `scope` with the grant implied by its depth.
    pub fn new(scope: TenancyScope) -> Self {
        let grant = Some(scope.implied_grant());
        Self {
            scope: RwLock::new(scope),
            grant: RwLock::new(grant),
        }
    }

    pub fn shared(scope: TenancyScope) -> Arc<Self> {
        Arc::new(Self::new(scope))
    }

    pub fn set_scope(&self, scope: TenancyScope) {
        *self.scope.write().unwrap_or_else(|e| e.into_inner()) = scope;
    }

    pub fn set_grant(&self, grant: Option<GrantScope>) {
        *self.grant.write().unwrap_or_else(|e| e.into_inner()) = grant;
    }
}

impl ScopeProvider for MockScopeProvider {
    fn current_scope(&self) -> TenancyScope {
        self.scope.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn grant_scope(&self) -> Option<GrantScope> {
        *self.grant.read().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// TRACING
// ============================================================================

/// Install a fmt subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for refcache inputs.

    use super::*;
    use proptest::prelude::*;

    /// Generate an opaque resource ID.
    pub fn arb_reference_id() -> impl Strategy<Value = String> {
        "[a-z]{1,8}-[0-9a-f]{1,6}"
    }

    /// Generate a tenancy scope of depth 0 to 2.
    pub fn arb_tenancy_scope() -> impl Strategy<Value = TenancyScope> {
        prop_oneof![
            Just(TenancyScope::root()),
            "domain-[0-9a-f]{4}".prop_map(|d| TenancyScope::domain(d)),
            ("domain-[0-9a-f]{4}", "workspace-[0-9a-f]{4}")
                .prop_map(|(d, w)| TenancyScope::workspace(d, w)),
        ]
    }

    /// Generate a request stream with repeats: 1 to 60 picks from a small pool.
    pub fn arb_id_requests() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(arb_reference_id(), 1..12).prop_flat_map(|pool| {
            let len = pool.len();
            prop::collection::vec(0..len, 1..60).prop_map(move |picks| {
                picks
                    .into_iter()
                    .map(|i| pool[i].clone())
                    .collect::<Vec<String>>()
            })
        })
    }

    /// Generate a dependency set with string values.
    pub fn arb_dependencies() -> impl Strategy<Value = Dependencies> {
        prop::collection::btree_map("[a-z_]{1,12}", "[a-z0-9-]{1,8}", 0..4).prop_map(|map| {
            map.into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect()
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Raw records shaped like the list APIs of the built-in resource types.

    use super::*;
    use serde_json::json;

    /// Config with the default window and small chunks.
    pub fn test_config() -> RefCacheConfig {
        RefCacheConfig::default().with_max_batch_size(100)
    }

    pub fn user_record(user_id: &str, name: &str, role_id: &str) -> RawRecord {
        json!({"user_id": user_id, "name": name, "role_id": role_id})
    }

    pub fn role_record(role_id: &str, name: &str, role_type: &str) -> RawRecord {
        json!({"role_id": role_id, "name": name, "role_type": role_type})
    }

    pub fn project_group_record(project_group_id: &str, name: &str) -> RawRecord {
        json!({"project_group_id": project_group_id, "name": name})
    }

    pub fn project_record(project_id: &str, name: &str, project_group_id: &str) -> RawRecord {
        json!({
            "project_id": project_id,
            "name": name,
            "project_group_id": project_group_id,
            "workspace_id": "w-1",
            "users": [],
            "project_type": "PRIVATE",
        })
    }

    /// `count` projects `p-0..` spread over three groups.
    pub fn project_records(count: usize) -> Vec<RawRecord> {
        (0..count)
            .map(|i| {
                project_record(
                    &format!("p-{i}"),
                    &format!("Project {i}"),
                    &format!("pg-{}", i % 3),
                )
            })
            .collect()
    }

    pub fn query_set_record(id: &str, name: &str, query_set_id: &str) -> RawRecord {
        json!({
            "cloud_service_query_set_id": id,
            "name": name,
            "query_set_id": query_set_id,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_mock_fetcher_applies_filters() {
        let fetcher = MockFetcher::new(fixtures::project_records(6));
        let query = ListQuery::new()
            .with_filter(QueryFilter::any_of("project_id", ["p-0", "p-3", "p-5"]))
            .with_filter(QueryFilter::eq("project_group_id", "pg-0"));

        let response = fetcher.list(query).await.unwrap();
        let ids: Vec<&str> = response
            .results
            .iter()
            .filter_map(|r| refcache_core::record_str(r, "project_id"))
            .collect();
        assert_eq!(ids, vec!["p-0", "p-3"]);
        assert_eq!(fetcher.requested_ids("project_id"), vec![vec!["p-0", "p-3", "p-5"]]);
    }

    #[tokio::test]
    async fn test_mock_fetcher_failure_toggle() {
        let fetcher = MockFetcher::new(vec![]);
        fetcher.fail_with(Some(FetchError::Network {
            message: "down".to_string(),
        }));
        assert!(fetcher.list(ListQuery::new()).await.is_err());

        fetcher.fail_with(None);
        assert!(fetcher.list(ListQuery::new()).await.is_ok());
        assert_eq!(fetcher.call_count(), 2);
    }

    #[test]
    fn test_scope_provider_switches() {
        let provider = MockScopeProvider::new(TenancyScope::workspace("d", "w"));
        assert_eq!(provider.grant_scope(), Some(GrantScope::Workspace));

        provider.set_scope(TenancyScope::domain("d"));
        provider.set_grant(None);
        assert_eq!(provider.current_scope(), TenancyScope::domain("d"));
        assert_eq!(provider.grant_scope(), None);
    }

    proptest! {
        #[test]
        fn prop_id_requests_draw_from_small_pool(ids in generators::arb_id_requests()) {
            let distinct: std::collections::HashSet<_> = ids.iter().collect();
            prop_assert!(!ids.is_empty());
            prop_assert!(distinct.len() <= 11);
        }
    }
}
