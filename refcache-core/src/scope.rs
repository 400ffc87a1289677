//! Tenancy scopes and grant levels.

use serde::{Deserialize, Serialize};

/// Grant level of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrantScope {
    System,
    Domain,
    Workspace,
    User,
}

/// Ordered multi-tenant nesting context, outermost level first.
///
/// Absent levels are omitted rather than padded, so a domain-level scope and
/// a workspace-level scope never encode to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenancyScope {
    levels: Vec<String>,
}

impl TenancyScope {
    /// Scope with no tenancy levels.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn domain(domain_id: impl Into<String>) -> Self {
        Self {
            levels: vec![domain_id.into()],
        }
    }

    pub fn workspace(domain_id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            levels: vec![domain_id.into(), workspace_id.into()],
        }
    }

    /// Build from optional levels, skipping the absent ones.
    pub fn from_levels<I, S>(levels: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        Self {
            levels: levels.into_iter().flatten().map(Into::into).collect(),
        }
    }

    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Grant level implied by the nesting depth.
    pub fn implied_grant(&self) -> GrantScope {
        match self.levels.len() {
            0 => GrantScope::User,
            1 => GrantScope::Domain,
            _ => GrantScope::Workspace,
        }
    }
}
