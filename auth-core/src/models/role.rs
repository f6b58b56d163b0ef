//! Role model - named permission bundles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Permission;

/// Role entity. System roles have no organization; custom roles belong to one.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub organization_id: Option<Uuid>,
    /// Administrative bootstrap role: expands to every active permission at
    /// resolution time.
    pub grants_all: bool,
    pub is_active: bool,
    /// Bumped whenever the role's permission set changes.
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl Role {
    /// Create a new system-wide role.
    pub fn system(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            organization_id: None,
            grants_all: false,
            is_active: true,
            version: 1,
            created_at: now,
        }
    }

    /// Create a new organization-scoped custom role.
    pub fn custom(name: impl Into<String>, organization_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            organization_id: Some(organization_id),
            ..Self::system(name, now)
        }
    }

    pub fn is_system(&self) -> bool {
        self.organization_id.is_none()
    }
}

/// A role as it applies to one principal: what the assignment grants, where,
/// and at which role version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleGrant {
    pub role_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub grants_all: bool,
    pub version: i64,
    pub permissions: Vec<Permission>,
}
