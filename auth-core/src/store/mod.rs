//! Persistence seams for the core.
//!
//! Every piece of rotation, revocation and lockout state lives behind these
//! traits so that all instances observe the same truth. Two adapters are
//! provided: [`postgres::PgStore`] and [`memory::MemoryStore`].

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::retry::Retryable;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    AccountSecurityRecord, BlacklistEntry, LoginAttempt, Permission, PermissionRecord, Principal,
    RefreshTokenRecord, RevocationReason, RoleGrant, Session,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient: pool exhaustion, I/O, serialization conflict, timeout.
    #[error("store unavailable: {0}")]
    Unavailable(anyhow::Error),

    #[error("store backend error: {0}")]
    Backend(anyhow::Error),

    /// A persisted row violates a model invariant.
    #[error("stored data violates invariant: {0}")]
    Invariant(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        StoreError::is_retryable(self)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let transient = match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
            // serialization_failure, deadlock_detected
            sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001" | "40P01")),
            _ => false,
        };

        if transient {
            StoreError::Unavailable(anyhow::anyhow!(err))
        } else {
            StoreError::Backend(anyhow::anyhow!(err))
        }
    }
}

/// Bound a store operation. An elapsed timeout drops the future, which rolls
/// back any open transaction.
pub async fn with_timeout<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(anyhow::anyhow!(
            "{} timed out after {}ms",
            operation,
            limit.as_millis()
        ))),
    }
}

/// Everything the rotation commit writes, applied in one transaction.
#[derive(Debug, Clone)]
pub struct RotationCommit {
    pub old_token_id: Uuid,
    /// Blacklist entry for the old refresh token's jti.
    pub old_token_blacklist: BlacklistEntry,
    pub new_record: RefreshTokenRecord,
    pub session_id: Uuid,
    pub ip_address: Option<String>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    Committed,
    /// The old token was no longer active (or its session had ended) when the
    /// commit ran. Nothing was written.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked,
    AlreadyInactive,
    NotFound,
}

/// Refresh tokens, sessions and the blacklist.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist a new session together with its first refresh token.
    async fn create_session(
        &self,
        session: &Session,
        token: &RefreshTokenRecord,
    ) -> Result<(), StoreError>;

    async fn find_refresh_token(&self, id: Uuid) -> Result<Option<RefreshTokenRecord>, StoreError>;

    async fn find_session(&self, id: Uuid) -> Result<Option<Session>, StoreError>;

    /// Deactivate the old token, blacklist it, insert the new one and move the
    /// session pointer, all or nothing. Concurrent commits against the same
    /// old token yield exactly one `Committed`.
    async fn rotate(&self, commit: &RotationCommit) -> Result<RotationOutcome, StoreError>;

    /// Deactivate one refresh token, blacklist its jti and end its session.
    /// The blacklist entry is written for already-inactive tokens too.
    async fn revoke_refresh_token(
        &self,
        token_id: Uuid,
        reason: RevocationReason,
        blacklist: &BlacklistEntry,
        now: DateTime<Utc>,
    ) -> Result<RevokeOutcome, StoreError>;

    /// Revoke every active refresh token and session of a principal in one
    /// transaction. Returns the number of tokens revoked.
    async fn revoke_all_for_principal(
        &self,
        principal_id: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// End one session of `principal_id`. Returns false when no such active
    /// session exists.
    async fn revoke_session(
        &self,
        principal_id: Uuid,
        session_id: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn list_active_sessions(&self, principal_id: Uuid) -> Result<Vec<Session>, StoreError>;

    /// Idempotent on jti.
    async fn blacklist(&self, entry: &BlacklistEntry) -> Result<(), StoreError>;

    async fn is_blacklisted(&self, jti: &str) -> Result<bool, StoreError>;

    /// Flip active-but-expired refresh tokens to inactive (`expired`) and end
    /// their sessions. Returns the number of tokens flipped.
    async fn expire_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete blacklist entries past their own expiry.
    async fn purge_blacklist(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Lockout counters and the login journal.
#[async_trait]
pub trait SecurityStore: Send + Sync {
    async fn get_security_record(
        &self,
        identifier: &str,
    ) -> Result<Option<AccountSecurityRecord>, StoreError>;

    /// Atomically count one failure. A record whose lockout has already
    /// elapsed starts a new episode at 1.
    async fn increment_failures(
        &self,
        identifier: &str,
        principal_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<AccountSecurityRecord, StoreError>;

    /// Extend the lockout to at least `locked_until`; never shortens it.
    async fn apply_lockout(
        &self,
        identifier: &str,
        locked_until: DateTime<Utc>,
        suspicious: bool,
        now: DateTime<Utc>,
    ) -> Result<AccountSecurityRecord, StoreError>;

    /// Reset counter and lockout together.
    async fn clear_security_record(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Reset only if the lockout has elapsed, so a concurrent fresh lockout is
    /// never wiped. Returns whether anything was cleared.
    async fn clear_elapsed_lockout(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn clear_expired_lockouts(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn record_login_attempt(&self, attempt: &LoginAttempt) -> Result<(), StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// `email` is already normalized.
    async fn find_principal_by_email(&self, email: &str) -> Result<Option<Principal>, StoreError>;

    async fn find_principal(&self, id: Uuid) -> Result<Option<Principal>, StoreError>;

    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> Result<(), StoreError>;
}

/// Change stamps a resolved permission set depends on beyond its roles'
/// own versions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthzVersions {
    /// Bumped on any change to the principal's role assignments or
    /// organization memberships.
    pub assignments: i64,
    /// Bumped on any change to the permission catalog.
    pub catalog: i64,
    /// Next instant one of the principal's active assignments starts or
    /// expires.
    pub next_transition: Option<DateTime<Utc>>,
}

/// Read side of the RBAC entities, plus permission catalog maintenance.
#[async_trait]
pub trait RbacStore: Send + Sync {
    /// Grants from the principal's active, unexpired assignments to active
    /// roles, with each role's active permissions.
    async fn load_role_grants(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoleGrant>, StoreError>;

    /// Every active permission in the catalog.
    async fn list_active_permissions(&self) -> Result<Vec<Permission>, StoreError>;

    async fn list_membership_organizations(&self, principal_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    /// `roots` plus every active descendant organization.
    async fn organization_descendants(&self, roots: &[Uuid]) -> Result<BTreeSet<Uuid>, StoreError>;

    /// Current version of each existing active role among `role_ids`.
    async fn role_versions(&self, role_ids: &[Uuid]) -> Result<HashMap<Uuid, i64>, StoreError>;

    async fn authz_versions(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AuthzVersions, StoreError>;

    async fn list_permission_records(&self) -> Result<Vec<PermissionRecord>, StoreError>;

    async fn insert_permission(&self, record: &PermissionRecord) -> Result<(), StoreError>;

    async fn update_permission_name(&self, id: Uuid, name: &str) -> Result<(), StoreError>;
}

/// A single backend serving every seam.
pub trait AuthStore: TokenStore + SecurityStore + UserStore + RbacStore {}

impl<T> AuthStore for T where T: TokenStore + SecurityStore + UserStore + RbacStore {}
