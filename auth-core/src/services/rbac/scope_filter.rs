//! Query narrowing for scoped permissions.
//!
//! Every list-style data query derives its predicate from a [`ScopeFilter`],
//! so the mapping from permission scope to rows lives in exactly one place.

use sqlx::{Postgres, QueryBuilder};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::EffectivePermissions;
use crate::models::PermissionScope;

/// Columns of the table being filtered. Static so they can be pushed into SQL
/// verbatim.
#[derive(Debug, Clone, Copy)]
pub struct ScopeColumns {
    pub organization: &'static str,
    pub owner: &'static str,
}

impl Default for ScopeColumns {
    fn default() -> Self {
        Self {
            organization: "organization_id",
            owner: "owner_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeFilter {
    /// `all` scope: no predicate.
    Unrestricted,
    /// `organization` scope over a non-empty set.
    Organizations(BTreeSet<Uuid>),
    /// `own` scope.
    OwnerOnly(Uuid),
    /// No applicable permission, or an empty organization set. Matches no rows.
    Nothing,
}

impl ScopeFilter {
    /// Filter for `resource:action` as held by `principal_id`. The widest held
    /// scope governs.
    pub fn for_operation(
        effective: &EffectivePermissions,
        principal_id: Uuid,
        resource: &str,
        action: &str,
    ) -> Self {
        match effective.widest_scope(resource, action) {
            Some(PermissionScope::All) => ScopeFilter::Unrestricted,
            Some(PermissionScope::Organization) if effective.is_super_admin => {
                ScopeFilter::Unrestricted
            }
            Some(PermissionScope::Organization) => {
                if effective.accessible_organization_ids.is_empty() {
                    ScopeFilter::Nothing
                } else {
                    ScopeFilter::Organizations(effective.accessible_organization_ids.clone())
                }
            }
            Some(PermissionScope::Own) => ScopeFilter::OwnerOnly(principal_id),
            None => ScopeFilter::Nothing,
        }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, ScopeFilter::Nothing)
    }

    /// Append the predicate to a query. Always pushes a complete boolean
    /// expression, so callers can write `WHERE ` or `AND ` before it.
    pub fn push_to(&self, builder: &mut QueryBuilder<'_, Postgres>, columns: ScopeColumns) {
        match self {
            ScopeFilter::Unrestricted => {
                builder.push("TRUE");
            }
            ScopeFilter::Organizations(ids) => {
                builder
                    .push(columns.organization)
                    .push(" = ANY(")
                    .push_bind(ids.iter().copied().collect::<Vec<Uuid>>())
                    .push(")");
            }
            ScopeFilter::OwnerOnly(owner) => {
                builder.push(columns.owner).push(" = ").push_bind(*owner);
            }
            ScopeFilter::Nothing => {
                builder.push("FALSE");
            }
        }
    }

    /// In-memory evaluation of the same predicate.
    pub fn permits(&self, organization_id: Option<Uuid>, owner_id: Option<Uuid>) -> bool {
        match self {
            ScopeFilter::Unrestricted => true,
            ScopeFilter::Organizations(ids) => organization_id.is_some_and(|id| ids.contains(&id)),
            ScopeFilter::OwnerOnly(owner) => owner_id == Some(*owner),
            ScopeFilter::Nothing => false,
        }
    }
}
