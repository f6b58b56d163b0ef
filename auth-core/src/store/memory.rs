//! In-process store for tests and single-node tooling.
//!
//! All state sits behind one mutex, so each trait call is atomic. The guard is
//! never held across an await.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Barrier;
use uuid::Uuid;

use super::{
    AuthzVersions, RbacStore, RevokeOutcome, RotationCommit, RotationOutcome, SecurityStore, StoreError,
    TokenStore, UserStore,
};
use crate::models::{
    expand_descendants, AccountSecurityRecord, BlacklistEntry, LoginAttempt, Organization,
    OrganizationMembership, Permission, PermissionRecord, Principal, RefreshTokenRecord,
    RevocationReason, Role, RoleAssignment, RoleGrant, Session, TokenType,
};

#[derive(Default)]
struct MemoryState {
    principals: HashMap<Uuid, Principal>,
    refresh_tokens: HashMap<Uuid, RefreshTokenRecord>,
    sessions: HashMap<Uuid, Session>,
    blacklist: HashMap<String, BlacklistEntry>,
    security: HashMap<String, AccountSecurityRecord>,
    login_attempts: Vec<LoginAttempt>,
    organizations: HashMap<Uuid, Organization>,
    memberships: Vec<OrganizationMembership>,
    roles: HashMap<Uuid, Role>,
    role_permissions: HashMap<Uuid, BTreeSet<Uuid>>,
    permissions: HashMap<Uuid, PermissionRecord>,
    assignments: Vec<RoleAssignment>,
    assignment_versions: HashMap<Uuid, i64>,
    catalog_version: i64,
}

impl MemoryState {
    fn bump_assignments(&mut self, principal_id: Uuid) {
        *self.assignment_versions.entry(principal_id).or_default() += 1;
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    rotation_gate: Mutex<Option<Arc<Barrier>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(anyhow::anyhow!(
                "memory store marked unavailable"
            )));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Backend(anyhow::anyhow!("memory store lock poisoned")))
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every `rotate` call waits on `gate` before committing, so racing
    /// rotations reach the commit together.
    pub fn set_rotation_gate(&self, gate: Option<Arc<Barrier>>) {
        let mut slot = self
            .rotation_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = gate;
    }

    // ==================== Seeding ====================

    pub fn insert_principal(&self, principal: Principal) -> Result<Uuid, StoreError> {
        let id = principal.id;
        self.lock()?.principals.insert(id, principal);
        Ok(id)
    }

    pub fn set_principal_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        if let Some(p) = self.lock()?.principals.get_mut(&id) {
            p.is_active = active;
        }
        Ok(())
    }

    pub fn insert_organization(&self, organization: Organization) -> Result<Uuid, StoreError> {
        let id = organization.id;
        self.lock()?.organizations.insert(id, organization);
        Ok(id)
    }

    pub fn add_membership(&self, membership: OrganizationMembership) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.bump_assignments(membership.principal_id);
        state.memberships.push(membership);
        Ok(())
    }

    pub fn insert_role(&self, role: Role) -> Result<Uuid, StoreError> {
        let id = role.id;
        self.lock()?.roles.insert(id, role);
        Ok(id)
    }

    /// Attach a permission to a role, adding it to the catalog if missing.
    /// Bumps the role version.
    pub fn grant_permission(&self, role_id: Uuid, permission: &Permission) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let name = permission.name();
        let existing = state
            .permissions
            .values()
            .find(|p| p.name == name)
            .map(|p| p.id);
        let permission_id = match existing {
            Some(id) => id,
            None => {
                let record = PermissionRecord::from_permission(permission);
                let id = record.id;
                state.permissions.insert(id, record);
                state.catalog_version += 1;
                id
            }
        };
        state.role_permissions.entry(role_id).or_default().insert(permission_id);
        if let Some(role) = state.roles.get_mut(&role_id) {
            role.version += 1;
        }
        Ok(())
    }

    /// Detach a permission from a role. Bumps the role version.
    pub fn revoke_permission(&self, role_id: Uuid, permission: &Permission) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let name = permission.name();
        let permission_id = state
            .permissions
            .values()
            .find(|p| p.name == name)
            .map(|p| p.id);
        if let (Some(pid), Some(set)) = (permission_id, state.role_permissions.get_mut(&role_id)) {
            set.remove(&pid);
        }
        if let Some(role) = state.roles.get_mut(&role_id) {
            role.version += 1;
        }
        Ok(())
    }

    pub fn set_permission_active(&self, name: &str, active: bool) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        for record in state.permissions.values_mut().filter(|p| p.name == name) {
            record.is_active = active;
        }
        state.catalog_version += 1;
        Ok(())
    }

    pub fn assign_role(&self, assignment: RoleAssignment) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.bump_assignments(assignment.principal_id);
        state.assignments.push(assignment);
        Ok(())
    }

    /// Toggle every assignment of `role_id` held by `principal_id`.
    pub fn set_assignment_active(
        &self,
        principal_id: Uuid,
        role_id: Uuid,
        active: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        for assignment in state
            .assignments
            .iter_mut()
            .filter(|a| a.principal_id == principal_id && a.role_id == role_id)
        {
            assignment.is_active = active;
        }
        state.bump_assignments(principal_id);
        Ok(())
    }

    // ==================== Inspection ====================

    pub fn login_attempts(&self) -> Result<Vec<LoginAttempt>, StoreError> {
        Ok(self.lock()?.login_attempts.clone())
    }

    pub fn refresh_tokens_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<RefreshTokenRecord>, StoreError> {
        let mut tokens: Vec<_> = self
            .lock()?
            .refresh_tokens
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect();
        tokens.sort_by_key(|t| t.rotation_count);
        Ok(tokens)
    }

    pub fn blacklist_len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.blacklist.len())
    }
}

fn end_session_if_current(
    sessions: &mut HashMap<Uuid, Session>,
    token: &RefreshTokenRecord,
    reason: RevocationReason,
    now: DateTime<Utc>,
) {
    if let Some(session) = sessions.get_mut(&token.session_id) {
        if session.current_refresh_token_id == token.id {
            session.end(reason, now);
        }
    }
}

fn refresh_blacklist_entry(
    token: &RefreshTokenRecord,
    reason: RevocationReason,
    now: DateTime<Utc>,
) -> BlacklistEntry {
    BlacklistEntry::new(
        token.id.to_string(),
        token.principal_id,
        TokenType::Refresh,
        token.expires_at,
        reason,
        now,
    )
}

fn reset_lockout(record: &mut AccountSecurityRecord, now: DateTime<Utc>) {
    record.failed_attempts = 0;
    record.locked_until = None;
    record.last_failed_at = None;
    record.prior_lockouts = 0;
    record.updated_at = now;
}

/// An elapsed lockout ends its episode but is remembered for escalation.
fn expire_lockout(record: &mut AccountSecurityRecord, now: DateTime<Utc>) {
    record.failed_attempts = 0;
    record.locked_until = None;
    record.last_failed_at = None;
    record.prior_lockouts += 1;
    record.updated_at = now;
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn create_session(
        &self,
        session: &Session,
        token: &RefreshTokenRecord,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.sessions.contains_key(&session.id) || state.refresh_tokens.contains_key(&token.id)
        {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "duplicate session or refresh token id"
            )));
        }
        state.sessions.insert(session.id, session.clone());
        state.refresh_tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn find_refresh_token(&self, id: Uuid) -> Result<Option<RefreshTokenRecord>, StoreError> {
        Ok(self.lock()?.refresh_tokens.get(&id).cloned())
    }

    async fn find_session(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        Ok(self.lock()?.sessions.get(&id).cloned())
    }

    async fn rotate(&self, commit: &RotationCommit) -> Result<RotationOutcome, StoreError> {
        let gate = self
            .rotation_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }

        let mut guard = self.lock()?;
        let state = &mut *guard;

        let old_usable = state
            .refresh_tokens
            .get(&commit.old_token_id)
            .is_some_and(|t| t.is_usable(commit.now));
        let session_current = state.sessions.get(&commit.session_id).is_some_and(|s| {
            s.is_active && s.current_refresh_token_id == commit.old_token_id
        });
        if !old_usable || !session_current {
            return Ok(RotationOutcome::Rejected);
        }

        if let Some(old) = state.refresh_tokens.get_mut(&commit.old_token_id) {
            old.deactivate(RevocationReason::Rotation, commit.now);
            old.last_used_at = Some(commit.now);
        }
        state
            .blacklist
            .entry(commit.old_token_blacklist.jti.clone())
            .or_insert_with(|| commit.old_token_blacklist.clone());
        state
            .refresh_tokens
            .insert(commit.new_record.id, commit.new_record.clone());
        if let Some(session) = state.sessions.get_mut(&commit.session_id) {
            session.current_refresh_token_id = commit.new_record.id;
            session.last_activity_at = commit.now;
            if commit.ip_address.is_some() {
                session.ip_address = commit.ip_address.clone();
            }
        }

        Ok(RotationOutcome::Committed)
    }

    async fn revoke_refresh_token(
        &self,
        token_id: Uuid,
        reason: RevocationReason,
        blacklist: &BlacklistEntry,
        now: DateTime<Utc>,
    ) -> Result<RevokeOutcome, StoreError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let Some(token) = state.refresh_tokens.get_mut(&token_id) else {
            return Ok(RevokeOutcome::NotFound);
        };
        let transitioned = token.deactivate(reason, now);
        let token = token.clone();

        state
            .blacklist
            .entry(blacklist.jti.clone())
            .or_insert_with(|| blacklist.clone());

        if !transitioned {
            return Ok(RevokeOutcome::AlreadyInactive);
        }
        end_session_if_current(&mut state.sessions, &token, reason, now);
        Ok(RevokeOutcome::Revoked)
    }

    async fn revoke_all_for_principal(
        &self,
        principal_id: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let mut count = 0;
        for token in state
            .refresh_tokens
            .values_mut()
            .filter(|t| t.principal_id == principal_id)
        {
            if token.deactivate(reason, now) {
                count += 1;
                let entry = refresh_blacklist_entry(token, reason, now);
                state.blacklist.entry(entry.jti.clone()).or_insert(entry);
            }
        }
        for session in state
            .sessions
            .values_mut()
            .filter(|s| s.principal_id == principal_id)
        {
            session.end(reason, now);
        }
        Ok(count)
    }

    async fn revoke_session(
        &self,
        principal_id: Uuid,
        session_id: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let Some(session) = state
            .sessions
            .get_mut(&session_id)
            .filter(|s| s.principal_id == principal_id && s.is_active)
        else {
            return Ok(false);
        };
        session.end(reason, now);

        for token in state
            .refresh_tokens
            .values_mut()
            .filter(|t| t.session_id == session_id)
        {
            if token.deactivate(reason, now) {
                let entry = refresh_blacklist_entry(token, reason, now);
                state.blacklist.entry(entry.jti.clone()).or_insert(entry);
            }
        }
        Ok(true)
    }

    async fn list_active_sessions(&self, principal_id: Uuid) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<_> = self
            .lock()?
            .sessions
            .values()
            .filter(|s| s.principal_id == principal_id && s.is_active)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(sessions)
    }

    async fn blacklist(&self, entry: &BlacklistEntry) -> Result<(), StoreError> {
        self.lock()?
            .blacklist
            .entry(entry.jti.clone())
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    async fn is_blacklisted(&self, jti: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.blacklist.contains_key(jti))
    }

    async fn expire_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let mut count = 0;
        for token in state
            .refresh_tokens
            .values_mut()
            .filter(|t| t.is_active && t.is_expired(now))
        {
            token.deactivate(RevocationReason::Expired, now);
            end_session_if_current(&mut state.sessions, token, RevocationReason::Expired, now);
            count += 1;
        }
        Ok(count)
    }

    async fn purge_blacklist(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let before = state.blacklist.len();
        state.blacklist.retain(|_, entry| !entry.is_expired(now));
        Ok((before - state.blacklist.len()) as u64)
    }
}

#[async_trait]
impl SecurityStore for MemoryStore {
    async fn get_security_record(
        &self,
        identifier: &str,
    ) -> Result<Option<AccountSecurityRecord>, StoreError> {
        Ok(self.lock()?.security.get(identifier).cloned())
    }

    async fn increment_failures(
        &self,
        identifier: &str,
        principal_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<AccountSecurityRecord, StoreError> {
        let mut state = self.lock()?;
        let record = state
            .security
            .entry(identifier.to_string())
            .or_insert_with(|| AccountSecurityRecord::new(identifier, principal_id, now));

        if record.lockout_elapsed_at(now) {
            expire_lockout(record, now);
        }
        record.failed_attempts += 1;
        record.last_failed_at = Some(now);
        record.updated_at = now;
        if record.principal_id.is_none() {
            record.principal_id = principal_id;
        }
        Ok(record.clone())
    }

    async fn apply_lockout(
        &self,
        identifier: &str,
        locked_until: DateTime<Utc>,
        suspicious: bool,
        now: DateTime<Utc>,
    ) -> Result<AccountSecurityRecord, StoreError> {
        let mut state = self.lock()?;
        let record = state
            .security
            .entry(identifier.to_string())
            .or_insert_with(|| AccountSecurityRecord::new(identifier, None, now));

        record.locked_until = Some(record.locked_until.map_or(locked_until, |u| u.max(locked_until)));
        record.suspicious_activity |= suspicious;
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn clear_security_record(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(record) = self.lock()?.security.get_mut(identifier) {
            reset_lockout(record, now);
        }
        Ok(())
    }

    async fn clear_elapsed_lockout(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        match state.security.get_mut(identifier) {
            Some(record) if record.lockout_elapsed_at(now) => {
                expire_lockout(record, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_expired_lockouts(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let mut count = 0;
        for record in state
            .security
            .values_mut()
            .filter(|r| r.lockout_elapsed_at(now))
        {
            expire_lockout(record, now);
            count += 1;
        }
        Ok(count)
    }

    async fn record_login_attempt(&self, attempt: &LoginAttempt) -> Result<(), StoreError> {
        self.lock()?.login_attempts.push(attempt.clone());
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_principal_by_email(&self, email: &str) -> Result<Option<Principal>, StoreError> {
        Ok(self
            .lock()?
            .principals
            .values()
            .find(|p| p.email == email)
            .cloned())
    }

    async fn find_principal(&self, id: Uuid) -> Result<Option<Principal>, StoreError> {
        Ok(self.lock()?.principals.get(&id).cloned())
    }

    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> Result<(), StoreError> {
        if let Some(p) = self.lock()?.principals.get_mut(&id) {
            p.password_hash = Some(password_hash.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl RbacStore for MemoryStore {
    async fn load_role_grants(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoleGrant>, StoreError> {
        let state = self.lock()?;
        let mut grants = Vec::new();

        for assignment in state
            .assignments
            .iter()
            .filter(|a| a.principal_id == principal_id && a.is_effective(now))
        {
            let Some(role) = state.roles.get(&assignment.role_id).filter(|r| r.is_active) else {
                continue;
            };

            let mut permissions = Vec::new();
            for pid in state.role_permissions.get(&role.id).into_iter().flatten() {
                if let Some(record) = state.permissions.get(pid).filter(|p| p.is_active) {
                    let permission = record
                        .permission()
                        .map_err(|e| StoreError::Invariant(e.to_string()))?;
                    permissions.push(permission);
                }
            }

            grants.push(RoleGrant {
                role_id: role.id,
                organization_id: assignment.organization_id,
                grants_all: role.grants_all,
                version: role.version,
                permissions,
            });
        }

        Ok(grants)
    }

    async fn list_active_permissions(&self) -> Result<Vec<Permission>, StoreError> {
        self.lock()?
            .permissions
            .values()
            .filter(|p| p.is_active)
            .map(|p| {
                p.permission()
                    .map_err(|e| StoreError::Invariant(e.to_string()))
            })
            .collect()
    }

    async fn list_membership_organizations(
        &self,
        principal_id: Uuid,
    ) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .lock()?
            .memberships
            .iter()
            .filter(|m| m.principal_id == principal_id && m.is_active)
            .map(|m| m.organization_id)
            .collect())
    }

    async fn organization_descendants(&self, roots: &[Uuid]) -> Result<BTreeSet<Uuid>, StoreError> {
        let state = self.lock()?;
        let organizations: Vec<Organization> = state.organizations.values().cloned().collect();
        Ok(expand_descendants(&organizations, roots.iter().copied()))
    }

    async fn role_versions(&self, role_ids: &[Uuid]) -> Result<HashMap<Uuid, i64>, StoreError> {
        let state = self.lock()?;
        Ok(role_ids
            .iter()
            .filter_map(|id| state.roles.get(id))
            .filter(|r| r.is_active)
            .map(|r| (r.id, r.version))
            .collect())
    }

    async fn authz_versions(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AuthzVersions, StoreError> {
        let state = self.lock()?;
        let next_transition = state
            .assignments
            .iter()
            .filter(|a| a.principal_id == principal_id && a.is_active)
            .flat_map(|a| [Some(a.granted_at), a.expires_at])
            .flatten()
            .filter(|t| *t > now)
            .min();
        Ok(AuthzVersions {
            assignments: state
                .assignment_versions
                .get(&principal_id)
                .copied()
                .unwrap_or_default(),
            catalog: state.catalog_version,
            next_transition,
        })
    }

    async fn list_permission_records(&self) -> Result<Vec<PermissionRecord>, StoreError> {
        Ok(self.lock()?.permissions.values().cloned().collect())
    }

    async fn insert_permission(&self, record: &PermissionRecord) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state.permissions.values().any(|p| p.name == record.name) {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "permission {} already exists",
                record.name
            )));
        }
        state.permissions.insert(record.id, record.clone());
        state.catalog_version += 1;
        Ok(())
    }

    async fn update_permission_name(&self, id: Uuid, name: &str) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if let Some(record) = state.permissions.get_mut(&id) {
            record.name = name.to_string();
        }
        state.catalog_version += 1;
        Ok(())
    }
}
