//! Role-based access control: effective permission resolution, authorization
//! decisions and the query-scope builder every data path narrows with.

pub mod cache;
pub mod catalog;
pub mod resolver;
pub mod scope_filter;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::models::{Permission, PermissionScope};

pub use cache::{LocalPermissionCache, PermissionCache, RedisPermissionCache};
pub use catalog::{synchronize_permissions, SyncReport};
pub use resolver::{AccessTarget, Decision, DenyReason, RbacResolver};
pub use scope_filter::{ScopeColumns, ScopeFilter};

/// The union of everything a principal's active role assignments grant.
///
/// Embedded in access tokens (as [`AuthzSnapshot`]) and cached between
/// resolutions. `role_versions` stamps each contributing role, and the
/// assignment and catalog versions stamp everything else the set was built
/// from, so a stale copy can be detected. `valid_until` is the next instant
/// an assignment starts or expires; the set is stale from then on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivePermissions {
    #[serde(rename = "prm")]
    pub permissions: BTreeSet<Permission>,
    #[serde(rename = "org")]
    pub accessible_organization_ids: BTreeSet<Uuid>,
    #[serde(rename = "sa")]
    pub is_super_admin: bool,
    #[serde(rename = "rv")]
    pub role_versions: BTreeMap<Uuid, i64>,
    #[serde(rename = "av", default)]
    pub assignment_version: i64,
    #[serde(rename = "cv", default)]
    pub catalog_version: i64,
    #[serde(rename = "vu", default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

/// Authorization state carried inside an access token.
pub type AuthzSnapshot = EffectivePermissions;

impl EffectivePermissions {
    pub fn role_ids(&self) -> Vec<Uuid> {
        self.role_versions.keys().copied().collect()
    }

    pub fn contains(&self, permission: &Permission) -> bool {
        self.permissions.contains(permission)
    }

    /// Scopes held for `resource:action`, narrowest first.
    pub fn scopes_for(&self, resource: &str, action: &str) -> BTreeSet<PermissionScope> {
        self.permissions
            .iter()
            .filter(|p| p.same_operation(resource, action))
            .map(|p| p.scope())
            .collect()
    }

    /// Widest scope held for `resource:action`.
    pub fn widest_scope(&self, resource: &str, action: &str) -> Option<PermissionScope> {
        self.scopes_for(resource, action).into_iter().next_back()
    }

    pub fn can_access_organization(&self, organization_id: Uuid) -> bool {
        self.is_super_admin || self.accessible_organization_ids.contains(&organization_id)
    }

    /// An assignment has started or expired since this set was resolved.
    pub fn has_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|until| until <= now)
    }
}
