//! Built-in resource type descriptors, projectors and joins.

use std::sync::Arc;

use refcache_core::{
    record_field, record_str, Dependencies, GrantScope, RawRecord, ReferenceItem, ReferenceMap,
    ResourceType,
};
use refcache_storage::{BulkFetcher, Projector, ReferenceData, ReferenceSource};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Describes how one resource type is looked up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeInfo {
    pub resource_type: ResourceType,
    /// Record field holding the canonical ID.
    pub id_key: String,
    /// Human-readable type name.
    pub name: String,
    /// Grants allowed to look this type up. Empty allows any known grant.
    #[serde(default)]
    pub required_scopes: Vec<GrantScope>,
    /// Fields requested from the list API. Empty requests all fields.
    #[serde(default)]
    pub only: Vec<String>,
    /// Parent filters every lookup is expected to carry.
    #[serde(default)]
    pub dependency_keys: Vec<String>,
}

impl ResourceTypeInfo {
    /// Descriptor visible to domain and workspace sessions.
    pub fn new(
        resource_type: impl Into<ResourceType>,
        id_key: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            id_key: id_key.into(),
            name: name.into(),
            required_scopes: vec![GrantScope::Domain, GrantScope::Workspace],
            only: Vec::new(),
            dependency_keys: Vec::new(),
        }
    }

    pub fn with_required_scopes(mut self, scopes: impl IntoIterator<Item = GrantScope>) -> Self {
        self.required_scopes = scopes.into_iter().collect();
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

    pub fn with_dependency_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Whether a session holding `grant` may look this type up.
    pub fn permits(&self, grant: Option<GrantScope>) -> bool {
        match grant {
            None => false,
            Some(grant) => self.required_scopes.is_empty() || self.required_scopes.contains(&grant),
        }
    }

    /// Declared dependency keys absent from `dependencies`.
    pub fn missing_dependencies<'a>(&'a self, dependencies: &Dependencies) -> Vec<&'a str> {
        self.dependency_keys
            .iter()
            .filter(|key| !dependencies.contains_key(key.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Fetch settings for this type.
    pub fn source<T: ReferenceData>(
        &self,
        fetcher: Arc<dyn BulkFetcher>,
        projector: Projector<T>,
    ) -> ReferenceSource<T> {
        ReferenceSource::from_projector(
            self.resource_type.clone(),
            self.id_key.clone(),
            fetcher,
            projector,
        )
        .with_only(self.only.iter().cloned())
    }
}

/// Descriptors of every built-in resource type.
pub fn builtin_resource_types() -> Vec<ResourceTypeInfo> {
    let any_grant = [GrantScope::Domain, GrantScope::Workspace, GrantScope::User];
    vec![
        ResourceTypeInfo::new("user", "user_id", "User").with_only(["user_id", "name", "role_id"]),
        ResourceTypeInfo::new("project", "project_id", "Project").with_only([
            "project_id",
            "name",
            "project_group_id",
            "users",
            "project_type",
            "workspace_id",
        ]),
        ResourceTypeInfo::new("project_group", "project_group_id", "Project Group")
            .with_only(["project_group_id", "name", "parent_group_id"]),
        ResourceTypeInfo::new("workspace", "workspace_id", "Workspace")
            .with_required_scopes(any_grant)
            .with_only(["workspace_id", "name", "state", "tags"]),
        ResourceTypeInfo::new("provider", "provider", "Provider").with_required_scopes(any_grant),
        ResourceTypeInfo::new("region", "region_code", "Region").with_required_scopes(any_grant),
        ResourceTypeInfo::new("role", "role_id", "Role")
            .with_only(["role_id", "name", "role_type"]),
        ResourceTypeInfo::new(
            "cloud_service_query_set",
            "cloud_service_query_set_id",
            "Cloud Service Query Set",
        )
        .with_dependency_keys(["query_set_id"]),
        ResourceTypeInfo::new("collector", "collector_id", "Collector"),
        ResourceTypeInfo::new("service_account", "service_account_id", "Service Account"),
        ResourceTypeInfo::new("plugin", "plugin_id", "Plugin").with_required_scopes(any_grant),
        ResourceTypeInfo::new("webhook", "webhook_id", "Webhook"),
        ResourceTypeInfo::new("secret", "secret_id", "Secret"),
        ResourceTypeInfo::new("trusted_account", "trusted_account_id", "Trusted Account"),
        ResourceTypeInfo::new("public_dashboard", "public_dashboard_id", "Public Dashboard"),
        ResourceTypeInfo::new("protocol", "protocol_id", "Protocol"),
        ResourceTypeInfo::new("cost_data_source", "data_source_id", "Cost Data Source"),
    ]
}

/// Descriptor of a built-in resource type.
pub fn builtin(resource_type: &str) -> Option<ResourceTypeInfo> {
    builtin_resource_types()
        .into_iter()
        .find(|info| info.resource_type.as_str() == resource_type)
}

// ============================================================================
// PROJECTORS
// ============================================================================

fn id_of(record: &RawRecord, id_key: &str) -> String {
    match record_field(record, id_key) {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => String::new(),
    }
}

/// Copy `fields` present on `record` into a data object.
fn pick(record: &RawRecord, fields: &[&str]) -> Value {
    let object: Map<String, Value> = fields
        .iter()
        .filter_map(|field| record_field(record, field).map(|v| (field.to_string(), v.clone())))
        .collect();
    Value::Object(object)
}

/// Label is the record's `name`, falling back to its ID.
pub fn generic_projector(id_key: impl Into<String>) -> Projector<Value> {
    let id_key = id_key.into();
    Arc::new(move |record: &RawRecord| {
        let id = id_of(record, &id_key);
        match record_str(record, "name") {
            Some(name) => ReferenceItem::new(id, name).with_name(name),
            None => ReferenceItem::fallback(id),
        }
    })
}

/// Label `"<user_id> (<name>)"`; data carries `role_id`.
pub fn user_projector() -> Projector<Value> {
    Arc::new(|record: &RawRecord| {
        let id = id_of(record, "user_id");
        let data = pick(record, &["role_id"]);
        match record_str(record, "name").filter(|name| !name.is_empty()) {
            Some(name) => ReferenceItem::new(id.clone(), format!("{id} ({name})"))
                .with_name(name)
                .with_data(data),
            None => ReferenceItem::fallback(id).with_data(data),
        }
    })
}

/// Label is the project name; data carries its group, workspace and members.
pub fn project_projector() -> Projector<Value> {
    Arc::new(|record: &RawRecord| {
        let id = id_of(record, "project_id");
        let data = pick(
            record,
            &["project_group_id", "workspace_id", "users", "project_type"],
        );
        let item = match record_str(record, "name") {
            Some(name) => ReferenceItem::new(id, name).with_name(name),
            None => ReferenceItem::fallback(id),
        };
        item.with_data(data)
    })
}

/// Generic label; data carries `role_type`.
pub fn role_projector() -> Projector<Value> {
    let generic = generic_projector("role_id");
    Arc::new(move |record: &RawRecord| generic(record).with_data(pick(record, &["role_type"])))
}

/// Projector of a built-in resource type.
pub fn projector_for(info: &ResourceTypeInfo) -> Projector<Value> {
    match info.resource_type.as_str() {
        "user" => user_projector(),
        "project" => project_projector(),
        "role" => role_projector(),
        _ => generic_projector(info.id_key.clone()),
    }
}

// ============================================================================
// JOINS
// ============================================================================

fn data_str<'a>(item: &'a ReferenceItem, field: &str) -> Option<&'a str> {
    item.data.as_ref()?.get(field)?.as_str()
}

fn with_fields(item: &ReferenceItem, fields: Value) -> ReferenceItem {
    let mut data = match &item.data {
        Some(Value::Object(object)) => object.clone(),
        _ => Map::new(),
    };
    if let Value::Object(extra) = fields {
        data.extend(extra);
    }
    ReferenceItem {
        data: Some(Value::Object(data)),
        ..item.clone()
    }
}

/// Prefix a project's label with its group: `"Group > Project"`.
///
/// Returns `None` while the group is not resolved.
pub fn project_group_label(
    project: &ReferenceItem,
    _id: &str,
    groups: &ReferenceMap,
) -> Option<ReferenceItem> {
    let group_id = data_str(project, "project_group_id")?;
    let group = groups.get(group_id)?;
    let group_name = group.name.as_deref().unwrap_or(&group.label);
    let project_name = project.name.as_deref().unwrap_or(&project.label);

    let mut joined = with_fields(
        project,
        json!({"group_info": {"id": group_id, "name": group_name}}),
    );
    joined.label = format!("{group_name} > {project_name}");
    Some(joined)
}

/// Add `role_name` and `role_type` of the user's role.
///
/// Returns `None` while the role is not resolved.
pub fn user_role(user: &ReferenceItem, _id: &str, roles: &ReferenceMap) -> Option<ReferenceItem> {
    let role_id = data_str(user, "role_id")?;
    let role = roles.get(role_id)?;
    let role_name = role.name.as_deref().unwrap_or(&role.label);
    let role_type = data_str(role, "role_type");
    Some(with_fields(
        user,
        json!({"role_name": role_name, "role_type": role_type}),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let user = builtin("user").unwrap();
        assert_eq!(user.id_key, "user_id");
        assert_eq!(builtin("region").unwrap().id_key, "region_code");
        assert_eq!(builtin("provider").unwrap().id_key, "provider");
        assert!(builtin("dashboard_widget").is_none());
        assert_eq!(builtin_resource_types().len(), 17);
    }

    #[test]
    fn test_query_set_declares_dependency() {
        let info = builtin("cloud_service_query_set").unwrap();
        assert_eq!(info.missing_dependencies(&Dependencies::new()), vec!["query_set_id"]);

        let mut deps = Dependencies::new();
        deps.insert("query_set_id".to_string(), json!("qs-1"));
        assert!(info.missing_dependencies(&deps).is_empty());
    }

    #[test]
    fn test_permits() {
        let user = builtin("user").unwrap();
        assert!(user.permits(Some(GrantScope::Workspace)));
        assert!(!user.permits(Some(GrantScope::User)));
        assert!(!user.permits(None));

        let open = ResourceTypeInfo::new("thing", "thing_id", "Thing").with_required_scopes(Vec::new());
        assert!(open.permits(Some(GrantScope::System)));
    }

    #[test]
    fn test_user_label() {
        let project = user_projector();
        let item = project(&json!({"user_id": "ada@x", "name": "Ada", "role_id": "r-1"}));
        assert_eq!(item.label, "ada@x (Ada)");
        assert_eq!(item.data, Some(json!({"role_id": "r-1"})));

        let nameless = project(&json!({"user_id": "bob@x", "name": ""}));
        assert_eq!(nameless.label, "bob@x");
    }

    #[test]
    fn test_generic_label_falls_back_to_id() {
        let project = generic_projector("region_code");
        assert_eq!(project(&json!({"region_code": "eu-1", "name": "Europe"})).label, "Europe");
        assert_eq!(project(&json!({"region_code": "us-2"})).label, "us-2");
    }

    #[test]
    fn test_project_group_join() {
        let project = project_projector()(&json!({
            "project_id": "p-1",
            "name": "Alpha",
            "project_group_id": "pg-1",
        }));
        let mut groups = ReferenceMap::new();
        assert!(project_group_label(&project, "p-1", &groups).is_none());

        groups.insert(
            "pg-1".to_string(),
            ReferenceItem::new("pg-1", "Platform").with_name("Platform"),
        );
        let joined = project_group_label(&project, "p-1", &groups).unwrap();
        assert_eq!(joined.label, "Platform > Alpha");
        assert_eq!(joined.data.unwrap()["group_info"]["id"], "pg-1");
        assert_eq!(project.label, "Alpha");
    }

    #[test]
    fn test_user_role_join() {
        let user = user_projector()(&json!({"user_id": "u-1", "name": "Ada", "role_id": "r-1"}));
        let mut roles = ReferenceMap::new();
        roles.insert(
            "r-1".to_string(),
            role_projector()(&json!({"role_id": "r-1", "name": "Admin", "role_type": "DOMAIN_ADMIN"})),
        );

        let joined = user_role(&user, "u-1", &roles).unwrap();
        let data = joined.data.unwrap();
        assert_eq!(data["role_name"], "Admin");
        assert_eq!(data["role_type"], "DOMAIN_ADMIN");
        assert_eq!(data["role_id"], "r-1");
    }
}
