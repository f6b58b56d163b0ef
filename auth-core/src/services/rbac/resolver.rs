use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{EffectivePermissions, PermissionCache, ScopeFilter};
use crate::models::{Permission, PermissionScope};
use crate::store::{with_timeout, RbacStore, StoreError};
use crate::utils::Clock;

/// What an authorization check is aimed at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessTarget {
    pub organization_id: Option<Uuid>,
    /// The identity a resource belongs to, for `own`-scoped checks.
    pub owner_id: Option<Uuid>,
}

impl AccessTarget {
    pub fn organization(organization_id: Uuid) -> Self {
        Self {
            organization_id: Some(organization_id),
            owner_id: None,
        }
    }

    pub fn owner(owner_id: Uuid) -> Self {
        Self {
            organization_id: None,
            owner_id: Some(owner_id),
        }
    }

    pub fn owned_in(owner_id: Uuid, organization_id: Uuid) -> Self {
        Self {
            organization_id: Some(organization_id),
            owner_id: Some(owner_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// No held scope for the operation is at least as wide as requested.
    MissingPermission,
    /// Organization scope held, but the target is outside the accessible set.
    OutsideOrganization,
    /// Only `own` scope held, and the target belongs to someone else.
    NotOwner,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::MissingPermission => "missing_permission",
            DenyReason::OutsideOrganization => "outside_organization",
            DenyReason::NotOwner => "not_owner",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Allowed, under the widest scope that covered the target.
    Allow { scope: PermissionScope },
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

/// Computes effective permissions from role assignments and answers
/// authorization questions against them.
#[derive(Clone)]
pub struct RbacResolver {
    store: Arc<dyn RbacStore>,
    cache: Option<Arc<dyn PermissionCache>>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl RbacResolver {
    pub fn new(store: Arc<dyn RbacStore>, clock: Arc<dyn Clock>, store_timeout: Duration) -> Self {
        Self {
            store,
            cache: None,
            clock,
            store_timeout,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn PermissionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Union of permissions over the principal's active, unexpired role
    /// assignments, plus the organizations it can reach.
    ///
    /// A cached copy is used only while it is current (see [`Self::is_current`]).
    /// Cache failures fall through to the store.
    pub async fn resolve_effective_permissions(
        &self,
        principal_id: Uuid,
    ) -> Result<EffectivePermissions, StoreError> {
        if let Some(cache) = &self.cache {
            match cache.get(principal_id).await {
                Ok(Some(cached)) => {
                    if self.is_current(principal_id, &cached).await? {
                        tracing::debug!(principal_id = %principal_id, "Permission cache hit");
                        return Ok(cached);
                    }
                    tracing::debug!(principal_id = %principal_id, "Cached permissions are stale");
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(principal_id = %principal_id, error = %e, "Permission cache read failed");
                }
            }
        }

        let effective = self.load(principal_id).await?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(principal_id, &effective).await {
                tracing::warn!(principal_id = %principal_id, error = %e, "Permission cache write failed");
            }
        }

        Ok(effective)
    }

    /// Whether `snapshot` still describes `principal_id`: no assignment has
    /// started or expired since, the principal's assignments and the catalog
    /// are at the stamped versions, and every stamped role still exists, is
    /// active and is at its stamped version.
    pub async fn is_current(
        &self,
        principal_id: Uuid,
        snapshot: &EffectivePermissions,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        if snapshot.has_lapsed(now) {
            return Ok(false);
        }

        let versions = with_timeout(
            self.store_timeout,
            "authz_versions",
            self.store.authz_versions(principal_id, now),
        )
        .await?;
        if versions.assignments != snapshot.assignment_version
            || versions.catalog != snapshot.catalog_version
        {
            return Ok(false);
        }

        if snapshot.role_versions.is_empty() {
            return Ok(true);
        }

        let role_ids = snapshot.role_ids();
        let current = with_timeout(
            self.store_timeout,
            "role_versions",
            self.store.role_versions(&role_ids),
        )
        .await?;

        Ok(current.len() == snapshot.role_versions.len()
            && snapshot
                .role_versions
                .iter()
                .all(|(id, version)| current.get(id) == Some(version)))
    }

    async fn load(&self, principal_id: Uuid) -> Result<EffectivePermissions, StoreError> {
        let now = self.clock.now();
        // Stamped before reading, so a change racing the load leaves the
        // result already stale.
        let versions = with_timeout(
            self.store_timeout,
            "authz_versions",
            self.store.authz_versions(principal_id, now),
        )
        .await?;
        let grants = with_timeout(
            self.store_timeout,
            "load_role_grants",
            self.store.load_role_grants(principal_id, now),
        )
        .await?;

        let mut permissions: BTreeSet<Permission> = BTreeSet::new();
        let mut role_versions = BTreeMap::new();
        let mut roots: BTreeSet<Uuid> = with_timeout(
            self.store_timeout,
            "list_membership_organizations",
            self.store.list_membership_organizations(principal_id),
        )
        .await?
        .into_iter()
        .collect();
        let mut is_super_admin = false;
        let mut catalog: Option<Vec<Permission>> = None;

        for grant in &grants {
            role_versions.insert(grant.role_id, grant.version);
            permissions.extend(grant.permissions.iter().cloned());
            if let Some(organization_id) = grant.organization_id {
                roots.insert(organization_id);
            }

            if !grant.grants_all {
                continue;
            }

            // Expanded now, so permissions added later reach existing holders.
            if catalog.is_none() {
                catalog = Some(
                    with_timeout(
                        self.store_timeout,
                        "list_active_permissions",
                        self.store.list_active_permissions(),
                    )
                    .await?,
                );
            }
            let all = catalog.as_deref().unwrap_or_default();

            match grant.organization_id {
                None => {
                    is_super_admin = true;
                    permissions.extend(all.iter().cloned());
                }
                // Bootstrap role held inside one organization: never wider
                // than organization scope.
                Some(_) => permissions.extend(all.iter().map(|p| {
                    if p.scope() == PermissionScope::All {
                        p.with_scope(PermissionScope::Organization)
                    } else {
                        p.clone()
                    }
                })),
            }
        }

        let accessible_organization_ids = if roots.is_empty() {
            BTreeSet::new()
        } else {
            let roots: Vec<Uuid> = roots.into_iter().collect();
            with_timeout(
                self.store_timeout,
                "organization_descendants",
                self.store.organization_descendants(&roots),
            )
            .await?
        };

        tracing::debug!(
            principal_id = %principal_id,
            roles = role_versions.len(),
            permissions = permissions.len(),
            organizations = accessible_organization_ids.len(),
            "Resolved effective permissions"
        );

        Ok(EffectivePermissions {
            permissions,
            accessible_organization_ids,
            is_super_admin,
            role_versions,
            assignment_version: versions.assignments,
            catalog_version: versions.catalog,
            valid_until: versions.next_transition,
        })
    }

    /// Resolve, then decide.
    pub async fn authorize(
        &self,
        principal_id: Uuid,
        permission: &Permission,
        target: AccessTarget,
    ) -> Result<Decision, StoreError> {
        let effective = self.resolve_effective_permissions(principal_id).await?;
        Ok(Self::decide(&effective, principal_id, permission, target))
    }

    /// Allowed if some held scope for the operation is at least as wide as
    /// the requested one and covers the target. Scopes are tried widest
    /// first, so `all` beats `organization` when both are held.
    pub fn decide(
        effective: &EffectivePermissions,
        principal_id: Uuid,
        permission: &Permission,
        target: AccessTarget,
    ) -> Decision {
        let held: Vec<PermissionScope> = effective
            .scopes_for(permission.resource(), permission.action())
            .into_iter()
            .rev()
            .filter(|scope| *scope >= permission.scope())
            .collect();

        let Some(widest) = held.first().copied() else {
            return Decision::Deny(DenyReason::MissingPermission);
        };

        for scope in &held {
            let covered = match scope {
                PermissionScope::All => true,
                PermissionScope::Organization => target
                    .organization_id
                    .is_some_and(|org| effective.can_access_organization(org)),
                PermissionScope::Own => target.owner_id == Some(principal_id),
            };
            if covered {
                return Decision::Allow { scope: *scope };
            }
        }

        match widest {
            PermissionScope::Own => Decision::Deny(DenyReason::NotOwner),
            _ => Decision::Deny(DenyReason::OutsideOrganization),
        }
    }

    /// The row predicate for list-style queries on `resource:action`.
    pub async fn scope_filter(
        &self,
        principal_id: Uuid,
        resource: &str,
        action: &str,
    ) -> Result<ScopeFilter, StoreError> {
        let effective = self.resolve_effective_permissions(principal_id).await?;
        Ok(ScopeFilter::for_operation(
            &effective,
            principal_id,
            resource,
            action,
        ))
    }
}
