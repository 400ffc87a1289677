//! refcache Reference - Live Reference Maps and Joins
//!
//! Binds resource types to the batching repository layer:
//! - [`ReferenceDataModel`]: live, scope-aware map plus `request(id)`
//! - [`CrossReferenceProxy`]: lazy join of a model with one or more others, recomputed per read
//! - [`catalog`]: built-in resource type descriptors, projectors and joins

pub mod catalog;
pub mod model;
pub mod proxy;

pub use catalog::{
    builtin, builtin_resource_types, generic_projector, project_group_label, project_projector,
    projector_for, role_projector, user_projector, user_role, ResourceTypeInfo,
};
pub use model::{ReferenceContext, ReferenceDataModel};
pub use proxy::{CrossReferenceProxy, JoinResolver};

use std::sync::Arc;

/// Projects labelled `"Group > Project"` once their group is resolved.
pub fn project_with_group(
    projects: &Arc<ReferenceDataModel>,
    groups: &Arc<ReferenceDataModel>,
) -> CrossReferenceProxy {
    CrossReferenceProxy::new(projects, groups, project_group_label)
}

/// Users carrying `role_name` and `role_type` once their role is resolved.
pub fn user_with_role(
    users: &Arc<ReferenceDataModel>,
    roles: &Arc<ReferenceDataModel>,
) -> CrossReferenceProxy {
    CrossReferenceProxy::new(users, roles, user_role)
}
