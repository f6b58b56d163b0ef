//! PostgreSQL store.
//!
//! Conditional updates on `is_active` serialize competing rotations and
//! revocations of the same token; unrelated sessions touch disjoint rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::FromRow;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use super::{
    AuthzVersions, RbacStore, RevokeOutcome, RotationCommit, RotationOutcome, SecurityStore, StoreError,
    TokenStore, UserStore,
};
use crate::models::{
    AccountSecurityRecord, BlacklistEntry, LoginAttempt, Permission, PermissionRecord, Principal,
    RefreshTokenRecord, RevocationReason, RoleGrant, Session,
};

const REFRESH_TOKEN_COLUMNS: &str = "id, principal_id, session_id, token_hash, device_fingerprint, \
     ip_address, remember_me, issued_at, expires_at, last_used_at, is_active, revoked_reason, \
     revoked_at, rotation_count";

const SESSION_COLUMNS: &str = "id, principal_id, current_refresh_token_id, device_fingerprint, \
     ip_address, user_agent, created_at, last_activity_at, is_active, ended_at, end_reason";

const SECURITY_COLUMNS: &str = "identifier, principal_id, failed_attempts, last_failed_at, \
     locked_until, prior_lockouts, suspicious_activity, updated_at";

const PRINCIPAL_COLUMNS: &str = "id, email, is_active, password_hash, deleted_at, created_at";

#[derive(Debug, FromRow)]
struct RefreshTokenRow {
    id: Uuid,
    principal_id: Uuid,
    session_id: Uuid,
    token_hash: String,
    device_fingerprint: String,
    ip_address: Option<String>,
    remember_me: bool,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
    is_active: bool,
    revoked_reason: Option<String>,
    revoked_at: Option<DateTime<Utc>>,
    rotation_count: i32,
}

impl TryFrom<RefreshTokenRow> for RefreshTokenRecord {
    type Error = StoreError;

    fn try_from(row: RefreshTokenRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            principal_id: row.principal_id,
            session_id: row.session_id,
            token_hash: row.token_hash,
            device_fingerprint: row.device_fingerprint,
            ip_address: row.ip_address,
            remember_me: row.remember_me,
            issued_at: row.issued_at,
            expires_at: row.expires_at,
            last_used_at: row.last_used_at,
            is_active: row.is_active,
            revoked_reason: parse_reason(row.revoked_reason)?,
            revoked_at: row.revoked_at,
            rotation_count: row.rotation_count,
        })
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: Uuid,
    principal_id: Uuid,
    current_refresh_token_id: Uuid,
    device_fingerprint: String,
    ip_address: Option<String>,
    user_agent: Option<String>,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    is_active: bool,
    ended_at: Option<DateTime<Utc>>,
    end_reason: Option<String>,
}

impl TryFrom<SessionRow> for Session {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            principal_id: row.principal_id,
            current_refresh_token_id: row.current_refresh_token_id,
            device_fingerprint: row.device_fingerprint,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            created_at: row.created_at,
            last_activity_at: row.last_activity_at,
            is_active: row.is_active,
            ended_at: row.ended_at,
            end_reason: parse_reason(row.end_reason)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct GrantRow {
    role_id: Uuid,
    organization_id: Option<Uuid>,
    grants_all: bool,
    version: i64,
}

#[derive(Debug, FromRow)]
struct RolePermissionRow {
    role_id: Uuid,
    #[sqlx(flatten)]
    permission: PermissionRecord,
}

fn parse_reason(raw: Option<String>) -> Result<Option<RevocationReason>, StoreError> {
    raw.map(|r| r.parse::<RevocationReason>().map_err(StoreError::Invariant))
        .transpose()
}

fn to_permission(record: &PermissionRecord) -> Result<Permission, StoreError> {
    record
        .permission()
        .map_err(|e| StoreError::Invariant(e.to_string()))
}

/// Blacklist refresh tokens by id, skipping ones already present.
async fn blacklist_refresh_tokens(
    conn: &mut PgConnection,
    principal_id: Uuid,
    tokens: &[(Uuid, DateTime<Utc>)],
    reason: RevocationReason,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    if tokens.is_empty() {
        return Ok(());
    }
    let jtis: Vec<String> = tokens.iter().map(|(id, _)| id.to_string()).collect();
    let expiries: Vec<DateTime<Utc>> = tokens.iter().map(|(_, exp)| *exp).collect();

    sqlx::query(
        r#"
        INSERT INTO token_blacklist (jti, principal_id, token_type, expires_at, reason, created_at)
        SELECT t.jti, $3, 'refresh', t.expires_at, $4, $5
        FROM UNNEST($1::text[], $2::timestamptz[]) AS t(jti, expires_at)
        ON CONFLICT (jti) DO NOTHING
        "#,
    )
    .bind(&jtis)
    .bind(&expiries)
    .bind(principal_id)
    .bind(reason.as_str())
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_blacklist_entry(
    conn: &mut PgConnection,
    entry: &BlacklistEntry,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO token_blacklist (jti, principal_id, token_type, expires_at, reason, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (jti) DO NOTHING
        "#,
    )
    .bind(&entry.jti)
    .bind(entry.principal_id)
    .bind(entry.token_type.as_str())
    .bind(entry.expires_at)
    .bind(entry.reason.as_str())
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// PostgreSQL-backed implementation of every store seam.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn create_session(
        &self,
        session: &Session,
        token: &RefreshTokenRecord,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sessions (id, principal_id, current_refresh_token_id, device_fingerprint,
                ip_address, user_agent, created_at, last_activity_at, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE)
            "#,
        )
        .bind(session.id)
        .bind(session.principal_id)
        .bind(session.current_refresh_token_id)
        .bind(&session.device_fingerprint)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(session.created_at)
        .bind(session.last_activity_at)
        .execute(&mut *tx)
        .await?;

        insert_refresh_token(&mut tx, token).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_refresh_token(&self, id: Uuid) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let row = sqlx::query_as::<_, RefreshTokenRow>(&format!(
            "SELECT {} FROM refresh_tokens WHERE id = $1",
            REFRESH_TOKEN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RefreshTokenRecord::try_from).transpose()
    }

    async fn find_session(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM sessions WHERE id = $1",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Session::try_from).transpose()
    }

    async fn rotate(&self, commit: &RotationCommit) -> Result<RotationOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row lock on the old token; a concurrent rotation blocks here and then
        // sees is_active = FALSE.
        let deactivated = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET is_active = FALSE, revoked_reason = $2, revoked_at = $3, last_used_at = $3
            WHERE id = $1 AND is_active AND expires_at > $3
            "#,
        )
        .bind(commit.old_token_id)
        .bind(RevocationReason::Rotation.as_str())
        .bind(commit.now)
        .execute(&mut *tx)
        .await?;

        if deactivated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(RotationOutcome::Rejected);
        }

        insert_refresh_token(&mut tx, &commit.new_record).await?;

        let moved = sqlx::query(
            r#"
            UPDATE sessions
            SET current_refresh_token_id = $2, last_activity_at = $3,
                ip_address = COALESCE($4, ip_address)
            WHERE id = $1 AND is_active AND current_refresh_token_id = $5
            "#,
        )
        .bind(commit.session_id)
        .bind(commit.new_record.id)
        .bind(commit.now)
        .bind(&commit.ip_address)
        .bind(commit.old_token_id)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(RotationOutcome::Rejected);
        }

        insert_blacklist_entry(&mut tx, &commit.old_token_blacklist).await?;

        tx.commit().await?;
        Ok(RotationOutcome::Committed)
    }

    async fn revoke_refresh_token(
        &self,
        token_id: Uuid,
        reason: RevocationReason,
        blacklist: &BlacklistEntry,
        now: DateTime<Utc>,
    ) -> Result<RevokeOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let session_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE refresh_tokens
            SET is_active = FALSE, revoked_reason = $2, revoked_at = $3
            WHERE id = $1 AND is_active
            RETURNING session_id
            "#,
        )
        .bind(token_id)
        .bind(reason.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match session_id {
            Some(session_id) => {
                sqlx::query(
                    r#"
                    UPDATE sessions SET is_active = FALSE, ended_at = $3, end_reason = $4
                    WHERE id = $1 AND current_refresh_token_id = $2 AND is_active
                    "#,
                )
                .bind(session_id)
                .bind(token_id)
                .bind(now)
                .bind(reason.as_str())
                .execute(&mut *tx)
                .await?;
                RevokeOutcome::Revoked
            }
            None => {
                let exists: bool =
                    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM refresh_tokens WHERE id = $1)")
                        .bind(token_id)
                        .fetch_one(&mut *tx)
                        .await?;
                if !exists {
                    tx.rollback().await?;
                    return Ok(RevokeOutcome::NotFound);
                }
                RevokeOutcome::AlreadyInactive
            }
        };

        insert_blacklist_entry(&mut tx, blacklist).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn revoke_all_for_principal(
        &self,
        principal_id: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let revoked: Vec<(Uuid, DateTime<Utc>)> = sqlx::query_as(
            r#"
            UPDATE refresh_tokens
            SET is_active = FALSE, revoked_reason = $2, revoked_at = $3
            WHERE principal_id = $1 AND is_active
            RETURNING id, expires_at
            "#,
        )
        .bind(principal_id)
        .bind(reason.as_str())
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        blacklist_refresh_tokens(&mut tx, principal_id, &revoked, reason, now).await?;

        sqlx::query(
            r#"
            UPDATE sessions SET is_active = FALSE, ended_at = $2, end_reason = $3
            WHERE principal_id = $1 AND is_active
            "#,
        )
        .bind(principal_id)
        .bind(now)
        .bind(reason.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(revoked.len() as u64)
    }

    async fn revoke_session(
        &self,
        principal_id: Uuid,
        session_id: Uuid,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let ended = sqlx::query(
            r#"
            UPDATE sessions SET is_active = FALSE, ended_at = $3, end_reason = $4
            WHERE id = $1 AND principal_id = $2 AND is_active
            "#,
        )
        .bind(session_id)
        .bind(principal_id)
        .bind(now)
        .bind(reason.as_str())
        .execute(&mut *tx)
        .await?;

        if ended.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let revoked: Vec<(Uuid, DateTime<Utc>)> = sqlx::query_as(
            r#"
            UPDATE refresh_tokens
            SET is_active = FALSE, revoked_reason = $2, revoked_at = $3
            WHERE session_id = $1 AND is_active
            RETURNING id, expires_at
            "#,
        )
        .bind(session_id)
        .bind(reason.as_str())
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        blacklist_refresh_tokens(&mut tx, principal_id, &revoked, reason, now).await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list_active_sessions(&self, principal_id: Uuid) -> Result<Vec<Session>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM sessions WHERE principal_id = $1 AND is_active ORDER BY last_activity_at DESC",
            SESSION_COLUMNS
        ))
        .bind(principal_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Session::try_from).collect()
    }

    async fn blacklist(&self, entry: &BlacklistEntry) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_blacklist_entry(&mut conn, entry).await
    }

    async fn is_blacklisted(&self, jti: &str) -> Result<bool, StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM token_blacklist WHERE jti = $1)")
                .bind(jti)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn expire_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let expired: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE refresh_tokens
            SET is_active = FALSE, revoked_reason = $2, revoked_at = $1
            WHERE is_active AND expires_at <= $1
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(RevocationReason::Expired.as_str())
        .fetch_all(&mut *tx)
        .await?;

        if !expired.is_empty() {
            sqlx::query(
                r#"
                UPDATE sessions SET is_active = FALSE, ended_at = $2, end_reason = $3
                WHERE current_refresh_token_id = ANY($1) AND is_active
                "#,
            )
            .bind(&expired)
            .bind(now)
            .bind(RevocationReason::Expired.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(expired.len() as u64)
    }

    async fn purge_blacklist(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM token_blacklist WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

async fn insert_refresh_token(
    conn: &mut PgConnection,
    token: &RefreshTokenRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO refresh_tokens (id, principal_id, session_id, token_hash, device_fingerprint,
            ip_address, remember_me, issued_at, expires_at, is_active, rotation_count)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE, $10)
        "#,
    )
    .bind(token.id)
    .bind(token.principal_id)
    .bind(token.session_id)
    .bind(&token.token_hash)
    .bind(&token.device_fingerprint)
    .bind(&token.ip_address)
    .bind(token.remember_me)
    .bind(token.issued_at)
    .bind(token.expires_at)
    .bind(token.rotation_count)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl SecurityStore for PgStore {
    async fn get_security_record(
        &self,
        identifier: &str,
    ) -> Result<Option<AccountSecurityRecord>, StoreError> {
        Ok(sqlx::query_as::<_, AccountSecurityRecord>(&format!(
            "SELECT {} FROM account_security WHERE identifier = $1",
            SECURITY_COLUMNS
        ))
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn increment_failures(
        &self,
        identifier: &str,
        principal_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<AccountSecurityRecord, StoreError> {
        Ok(sqlx::query_as::<_, AccountSecurityRecord>(&format!(
            r#"
            INSERT INTO account_security (identifier, principal_id, failed_attempts, last_failed_at,
                locked_until, suspicious_activity, updated_at)
            VALUES ($1, $2, 1, $3, NULL, FALSE, $3)
            ON CONFLICT (identifier) DO UPDATE SET
                failed_attempts = CASE
                    WHEN account_security.locked_until <= $3 THEN 1
                    ELSE account_security.failed_attempts + 1
                END,
                locked_until = CASE
                    WHEN account_security.locked_until <= $3 THEN NULL
                    ELSE account_security.locked_until
                END,
                prior_lockouts = CASE
                    WHEN account_security.locked_until <= $3 THEN account_security.prior_lockouts + 1
                    ELSE account_security.prior_lockouts
                END,
                last_failed_at = $3,
                principal_id = COALESCE(account_security.principal_id, EXCLUDED.principal_id),
                updated_at = $3
            RETURNING {}
            "#,
            SECURITY_COLUMNS
        ))
        .bind(identifier)
        .bind(principal_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn apply_lockout(
        &self,
        identifier: &str,
        locked_until: DateTime<Utc>,
        suspicious: bool,
        now: DateTime<Utc>,
    ) -> Result<AccountSecurityRecord, StoreError> {
        Ok(sqlx::query_as::<_, AccountSecurityRecord>(&format!(
            r#"
            INSERT INTO account_security (identifier, principal_id, failed_attempts, last_failed_at,
                locked_until, suspicious_activity, updated_at)
            VALUES ($1, NULL, 0, NULL, $2, $3, $4)
            ON CONFLICT (identifier) DO UPDATE SET
                locked_until = GREATEST(account_security.locked_until, EXCLUDED.locked_until),
                suspicious_activity = account_security.suspicious_activity OR EXCLUDED.suspicious_activity,
                updated_at = EXCLUDED.updated_at
            RETURNING {}
            "#,
            SECURITY_COLUMNS
        ))
        .bind(identifier)
        .bind(locked_until)
        .bind(suspicious)
        .bind(now)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn clear_security_record(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE account_security
            SET failed_attempts = 0, locked_until = NULL, last_failed_at = NULL,
                prior_lockouts = 0, updated_at = $2
            WHERE identifier = $1
            "#,
        )
        .bind(identifier)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_elapsed_lockout(
        &self,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE account_security
            SET failed_attempts = 0, locked_until = NULL, last_failed_at = NULL,
                prior_lockouts = prior_lockouts + 1, updated_at = $2
            WHERE identifier = $1 AND locked_until <= $2
            "#,
        )
        .bind(identifier)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_expired_lockouts(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE account_security
            SET failed_attempts = 0, locked_until = NULL, last_failed_at = NULL,
                prior_lockouts = prior_lockouts + 1, updated_at = $1
            WHERE locked_until <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn record_login_attempt(&self, attempt: &LoginAttempt) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO login_attempts (id, email, principal_id, ip_address, device_fingerprint,
                success, failure_reason, session_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(attempt.id)
        .bind(&attempt.email)
        .bind(attempt.principal_id)
        .bind(&attempt.ip_address)
        .bind(&attempt.device_fingerprint)
        .bind(attempt.success)
        .bind(attempt.failure_reason.map(|r| r.as_str()))
        .bind(attempt.session_id)
        .bind(attempt.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_principal_by_email(&self, email: &str) -> Result<Option<Principal>, StoreError> {
        Ok(sqlx::query_as::<_, Principal>(&format!(
            "SELECT {} FROM principals WHERE lower(email) = $1",
            PRINCIPAL_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_principal(&self, id: Uuid) -> Result<Option<Principal>, StoreError> {
        Ok(sqlx::query_as::<_, Principal>(&format!(
            "SELECT {} FROM principals WHERE id = $1",
            PRINCIPAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn update_password_hash(&self, id: Uuid, password_hash: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE principals SET password_hash = $2 WHERE id = $1")
            .bind(id)
            .bind(password_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RbacStore for PgStore {
    async fn load_role_grants(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoleGrant>, StoreError> {
        let grants = sqlx::query_as::<_, GrantRow>(
            r#"
            SELECT ra.role_id, ra.organization_id, r.grants_all, r.version
            FROM role_assignments ra
            JOIN roles r ON r.id = ra.role_id
            WHERE ra.principal_id = $1
              AND ra.is_active AND r.is_active
              AND ra.granted_at <= $2
              AND (ra.expires_at IS NULL OR ra.expires_at > $2)
            "#,
        )
        .bind(principal_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        if grants.is_empty() {
            return Ok(Vec::new());
        }

        let role_ids: Vec<Uuid> = grants.iter().map(|g| g.role_id).collect();
        let rows = sqlx::query_as::<_, RolePermissionRow>(
            r#"
            SELECT rp.role_id, p.id, p.name, p.resource, p.action, p.scope, p.is_active
            FROM role_permissions rp
            JOIN permissions p ON p.id = rp.permission_id
            WHERE rp.role_id = ANY($1) AND p.is_active
            "#,
        )
        .bind(&role_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_role: HashMap<Uuid, Vec<Permission>> = HashMap::new();
        for row in &rows {
            by_role
                .entry(row.role_id)
                .or_default()
                .push(to_permission(&row.permission)?);
        }

        Ok(grants
            .into_iter()
            .map(|g| RoleGrant {
                permissions: by_role.get(&g.role_id).cloned().unwrap_or_default(),
                role_id: g.role_id,
                organization_id: g.organization_id,
                grants_all: g.grants_all,
                version: g.version,
            })
            .collect())
    }

    async fn list_active_permissions(&self) -> Result<Vec<Permission>, StoreError> {
        let records = sqlx::query_as::<_, PermissionRecord>(
            "SELECT id, name, resource, action, scope, is_active FROM permissions WHERE is_active",
        )
        .fetch_all(&self.pool)
        .await?;
        records.iter().map(to_permission).collect()
    }

    async fn list_membership_organizations(
        &self,
        principal_id: Uuid,
    ) -> Result<Vec<Uuid>, StoreError> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT m.organization_id
            FROM organization_memberships m
            JOIN organizations o ON o.id = m.organization_id
            WHERE m.principal_id = $1 AND m.is_active AND o.is_active
            "#,
        )
        .bind(principal_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn organization_descendants(&self, roots: &[Uuid]) -> Result<BTreeSet<Uuid>, StoreError> {
        if roots.is_empty() {
            return Ok(BTreeSet::new());
        }
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE tree AS (
                SELECT id FROM organizations WHERE id = ANY($1) AND is_active
                UNION
                SELECT o.id FROM organizations o JOIN tree t ON o.parent_id = t.id
                WHERE o.is_active
            )
            SELECT id FROM tree
            "#,
        )
        .bind(roots)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    async fn role_versions(&self, role_ids: &[Uuid]) -> Result<HashMap<Uuid, i64>, StoreError> {
        if role_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(Uuid, i64)> =
            sqlx::query_as("SELECT id, version FROM roles WHERE id = ANY($1) AND is_active")
                .bind(role_ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn authz_versions(
        &self,
        principal_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AuthzVersions, StoreError> {
        let row: Option<(i64, i64, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT
                p.authz_version,
                COALESCE((SELECT version FROM permission_catalog), 0),
                (
                    SELECT MIN(t.at)
                    FROM role_assignments ra
                    CROSS JOIN LATERAL (VALUES (ra.granted_at), (ra.expires_at)) AS t(at)
                    WHERE ra.principal_id = p.id AND ra.is_active AND t.at > $2
                )
            FROM principals p
            WHERE p.id = $1
            "#,
        )
        .bind(principal_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|(assignments, catalog, next_transition)| AuthzVersions {
                assignments,
                catalog,
                next_transition,
            })
            .unwrap_or_default())
    }

    async fn list_permission_records(&self) -> Result<Vec<PermissionRecord>, StoreError> {
        Ok(sqlx::query_as::<_, PermissionRecord>(
            "SELECT id, name, resource, action, scope, is_active FROM permissions",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn insert_permission(&self, record: &PermissionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO permissions (id, name, resource, action, scope, is_active)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(&record.resource)
        .bind(&record.action)
        .bind(&record.scope)
        .bind(record.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_permission_name(&self, id: Uuid, name: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE permissions SET name = $2 WHERE id = $1")
            .bind(id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_with_unknown_reason_is_an_invariant_violation() {
        let now = Utc::now();
        let row = SessionRow {
            id: Uuid::new_v4(),
            principal_id: Uuid::new_v4(),
            current_refresh_token_id: Uuid::new_v4(),
            device_fingerprint: "fp".to_string(),
            ip_address: None,
            user_agent: None,
            created_at: now,
            last_activity_at: now,
            is_active: false,
            ended_at: Some(now),
            end_reason: Some("stolen".to_string()),
        };
        assert!(matches!(Session::try_from(row), Err(StoreError::Invariant(_))));
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_blacklist_round_trip() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = PgPool::connect(&url).await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let store = PgStore::new(pool);

        let entry = BlacklistEntry::new(
            Uuid::new_v4().to_string(),
            Uuid::new_v4(),
            crate::models::TokenType::Access,
            Utc::now() + chrono::Duration::minutes(15),
            RevocationReason::Logout,
            Utc::now(),
        );
        store.blacklist(&entry).await.unwrap();
        store.blacklist(&entry).await.unwrap();
        assert!(store.is_blacklisted(&entry.jti).await.unwrap());
    }
}
