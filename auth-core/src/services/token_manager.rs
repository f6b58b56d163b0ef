//! Token pair lifecycle: issuance, validation, rotation and revocation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::retry::{retry_with_backoff, RetryConfig};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{
    AuditAction, AuditEvent, AuditSeverity, BlacklistEntry, NewRefreshToken, RefreshTokenRecord,
    RevocationReason, Session, SessionInfo, TokenType,
};
use crate::services::audit::Auditor;
use crate::services::error::AuthError;
use crate::services::jwt::{AccessTokenClaims, JwtService, RefreshTokenClaims};
use crate::services::metrics;
use crate::services::rbac::{AuthzSnapshot, RbacResolver};
use crate::store::{
    with_timeout, RevokeOutcome, RotationCommit, RotationOutcome, StoreError, TokenStore,
};
use crate::utils::{Clock, DeviceFingerprinter, DeviceInfo};

/// Newly issued credentials.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token expiry.
    pub expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub session_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct TokenManagerSettings {
    pub store_timeout: Duration,
    /// Reject rotations presented from a different device fingerprint.
    pub strict_device_binding: bool,
    /// Retry budget for bulk revocation.
    pub bulk_retry: RetryConfig,
}

impl Default for TokenManagerSettings {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            strict_device_binding: false,
            bulk_retry: RetryConfig::quick(),
        }
    }
}

struct Minted {
    access_token: String,
    access_claims: AccessTokenClaims,
    refresh_token: String,
    refresh_claims: RefreshTokenClaims,
}

#[derive(Clone)]
pub struct TokenManager {
    store: Arc<dyn TokenStore>,
    jwt: JwtService,
    resolver: RbacResolver,
    fingerprinter: DeviceFingerprinter,
    auditor: Auditor,
    clock: Arc<dyn Clock>,
    settings: TokenManagerSettings,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn TokenStore>,
        jwt: JwtService,
        resolver: RbacResolver,
        fingerprinter: DeviceFingerprinter,
        auditor: Auditor,
        clock: Arc<dyn Clock>,
        settings: TokenManagerSettings,
    ) -> Self {
        Self {
            store,
            jwt,
            resolver,
            fingerprinter,
            auditor,
            clock,
            settings,
        }
    }

    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }

    async fn timed<T, F>(&self, operation: &str, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        with_timeout(self.settings.store_timeout, operation, fut).await
    }

    fn mint(
        &self,
        principal_id: Uuid,
        session_id: Uuid,
        token_id: Uuid,
        remember_me: bool,
        authz: AuthzSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Minted, AuthError> {
        let (access_token, access_claims) = self
            .jwt
            .generate_access_token(principal_id, session_id, authz, now)
            .map_err(signing_failure)?;
        let (refresh_token, refresh_claims) = self
            .jwt
            .generate_refresh_token(principal_id, session_id, token_id, remember_me, now)
            .map_err(signing_failure)?;

        Ok(Minted {
            access_token,
            access_claims,
            refresh_token,
            refresh_claims,
        })
    }

    /// Issue a fresh pair with a new session. Nothing is persisted unless the
    /// authorization snapshot loads.
    pub async fn create_token_pair(
        &self,
        principal_id: Uuid,
        device: &DeviceInfo,
        remember_me: bool,
    ) -> Result<TokenPair, AuthError> {
        let now = self.clock.now();
        let authz = self.resolver.resolve_effective_permissions(principal_id).await?;

        let session_id = Uuid::new_v4();
        let token_id = Uuid::new_v4();
        let minted = self.mint(principal_id, session_id, token_id, remember_me, authz, now)?;

        let device_fingerprint = self.fingerprinter.fingerprint(device);
        let record = RefreshTokenRecord::issue(NewRefreshToken {
            id: token_id,
            principal_id,
            session_id,
            token: &minted.refresh_token,
            device_fingerprint: device_fingerprint.clone(),
            ip_address: device.ip_address.clone(),
            remember_me,
            issued_at: now,
            expires_at: minted.refresh_claims.expires_at(),
            rotation_count: 0,
        });
        let session = Session {
            id: session_id,
            principal_id,
            current_refresh_token_id: token_id,
            device_fingerprint,
            ip_address: device.ip_address.clone(),
            user_agent: device.user_agent.clone(),
            created_at: now,
            last_activity_at: now,
            is_active: true,
            ended_at: None,
            end_reason: None,
        };

        self.timed("create_session", self.store.create_session(&session, &record))
            .await?;

        metrics::record_token_event("issued");
        tracing::info!(
            principal_id = %principal_id,
            session_id = %session_id,
            remember_me,
            "Issued token pair"
        );
        self.auditor
            .record(
                AuditEvent::new(AuditAction::TokenPairIssued, AuditSeverity::Info, now)
                    .principal(principal_id)
                    .ip(device.ip_address.as_deref())
                    .with("session_id", session_id.to_string())
                    .with("remember_me", remember_me),
            )
            .await;

        Ok(pair(minted))
    }

    /// Signature, expiry and blacklist. Any failure, including an unreachable
    /// blacklist, is `TokenInvalid`.
    pub async fn validate_access_token(&self, token: &str) -> Result<AccessTokenClaims, AuthError> {
        let now = self.clock.now();
        let claims = self.jwt.validate_access_token(token, now).map_err(|e| {
            tracing::debug!(error = %e, "Access token rejected");
            AuthError::TokenInvalid
        })?;

        match self
            .timed("is_blacklisted", self.store.is_blacklisted(&claims.jti))
            .await
        {
            Ok(false) => Ok(claims),
            Ok(true) => {
                tracing::debug!(jti = %claims.jti, "Access token is blacklisted");
                Err(AuthError::TokenInvalid)
            }
            Err(e) => {
                tracing::error!(jti = %claims.jti, error = %e, "Blacklist check failed; rejecting token");
                Err(AuthError::TokenInvalid)
            }
        }
    }

    /// Exchange a refresh token for a new pair.
    ///
    /// Returns `ReplayDetected` for reuse of a rotated or revoked token, and
    /// `StoreUnavailable` only when the store could not be reached; every
    /// other failure is `TokenInvalid`.
    pub async fn refresh_token_pair(
        &self,
        refresh_token: &str,
        device: &DeviceInfo,
    ) -> Result<TokenPair, AuthError> {
        match self.rotate(refresh_token, device).await {
            Ok(pair) => Ok(pair),
            Err(
                e @ (AuthError::ReplayDetected
                | AuthError::TokenInvalid
                | AuthError::StoreUnavailable),
            ) => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Rotation failed");
                Err(AuthError::TokenInvalid)
            }
        }
    }

    async fn rotate(&self, presented: &str, device: &DeviceInfo) -> Result<TokenPair, AuthError> {
        let now = self.clock.now();

        // presented -> verified
        let claims = self.jwt.validate_refresh_token(presented, now).map_err(|e| {
            tracing::debug!(stage = "verify", error = %e, "Refresh token rejected");
            AuthError::TokenInvalid
        })?;
        let token_id = claims.token_id().ok_or(AuthError::TokenInvalid)?;

        // verified -> checked-not-reused
        let record = self
            .timed("find_refresh_token", self.store.find_refresh_token(token_id))
            .await?;
        let Some(record) = record else {
            self.clone_suspected(&claims, device, "unknown_token_id", now)
                .await;
            return Err(AuthError::TokenInvalid);
        };
        if !record.matches_token(presented)
            || record.principal_id != claims.sub
            || record.session_id != claims.sid
        {
            self.clone_suspected(&claims, device, "record_mismatch", now)
                .await;
            return Err(AuthError::TokenInvalid);
        }
        if !record.is_active {
            self.replay_detected(&record, device, "inactive_record", now)
                .await;
            return Err(AuthError::ReplayDetected);
        }
        if record.is_expired(now) {
            tracing::debug!(stage = "lookup", jti = %claims.jti, "Refresh token record expired");
            return Err(AuthError::TokenInvalid);
        }

        if self
            .timed("is_blacklisted", self.store.is_blacklisted(&claims.jti))
            .await?
        {
            self.replay_detected(&record, device, "blacklisted", now)
                .await;
            return Err(AuthError::ReplayDetected);
        }

        if !self.fingerprinter.matches(device, &record.device_fingerprint) {
            self.device_mismatch(&record, device, now).await;
            if self.settings.strict_device_binding {
                return Err(AuthError::TokenInvalid);
            }
        }

        // checked-not-reused -> issued. Sliding expiry, same lifetime class.
        let authz = self
            .resolver
            .resolve_effective_permissions(record.principal_id)
            .await?;
        let new_token_id = Uuid::new_v4();
        let minted = self.mint(
            record.principal_id,
            record.session_id,
            new_token_id,
            record.remember_me,
            authz,
            now,
        )?;

        let new_record = RefreshTokenRecord::issue(NewRefreshToken {
            id: new_token_id,
            principal_id: record.principal_id,
            session_id: record.session_id,
            token: &minted.refresh_token,
            device_fingerprint: record.device_fingerprint.clone(),
            ip_address: device.ip_address.clone(),
            remember_me: record.remember_me,
            issued_at: now,
            expires_at: minted.refresh_claims.expires_at(),
            rotation_count: record.rotation_count + 1,
        });

        // issued -> old-invalidated -> committed, atomically
        let commit = RotationCommit {
            old_token_id: record.id,
            old_token_blacklist: BlacklistEntry::new(
                claims.jti.clone(),
                record.principal_id,
                TokenType::Refresh,
                record.expires_at,
                RevocationReason::Rotation,
                now,
            ),
            new_record,
            session_id: record.session_id,
            ip_address: device.ip_address.clone(),
            now,
        };

        match self.timed("rotate", self.store.rotate(&commit)).await? {
            RotationOutcome::Committed => {}
            RotationOutcome::Rejected => {
                self.replay_detected(&record, device, "lost_commit", now)
                    .await;
                return Err(AuthError::ReplayDetected);
            }
        }

        metrics::record_token_event("rotated");
        tracing::info!(
            principal_id = %record.principal_id,
            session_id = %record.session_id,
            rotation_count = record.rotation_count + 1,
            "Rotated refresh token"
        );
        self.auditor
            .record(
                AuditEvent::new(AuditAction::TokenRotated, AuditSeverity::Info, now)
                    .principal(record.principal_id)
                    .ip(device.ip_address.as_deref())
                    .with("session_id", record.session_id.to_string())
                    .with("rotation_count", record.rotation_count + 1),
            )
            .await;

        Ok(pair(minted))
    }

    /// Revoke one refresh token and end its session. Revoking a token that is
    /// already inactive, unknown or unreadable is a no-op returning false.
    pub async fn revoke_refresh_token(
        &self,
        refresh_token: &str,
        reason: RevocationReason,
    ) -> Result<bool, AuthError> {
        let now = self.clock.now();

        let claims = match self.jwt.decode_refresh_token_ignoring_expiry(refresh_token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring revocation of undecodable refresh token");
                return Ok(false);
            }
        };
        let Some(token_id) = claims.token_id() else {
            return Ok(false);
        };

        let Some(record) = self
            .timed("find_refresh_token", self.store.find_refresh_token(token_id))
            .await?
        else {
            return Ok(false);
        };
        if !record.matches_token(refresh_token) {
            tracing::warn!(jti = %claims.jti, "Revocation presented a token that does not match its record");
            return Ok(false);
        }

        let entry = BlacklistEntry::new(
            claims.jti.clone(),
            record.principal_id,
            TokenType::Refresh,
            record.expires_at,
            reason,
            now,
        );
        let outcome = self
            .timed(
                "revoke_refresh_token",
                self.store
                    .revoke_refresh_token(record.id, reason, &entry, now),
            )
            .await?;

        match outcome {
            RevokeOutcome::Revoked => {
                metrics::record_token_event("revoked");
                tracing::info!(
                    principal_id = %record.principal_id,
                    session_id = %record.session_id,
                    reason = %reason,
                    "Revoked refresh token"
                );
                self.auditor
                    .record(
                        AuditEvent::new(AuditAction::TokenRevoked, AuditSeverity::Info, now)
                            .principal(record.principal_id)
                            .with("session_id", record.session_id.to_string())
                            .with("reason", reason.as_str()),
                    )
                    .await;
                Ok(true)
            }
            RevokeOutcome::AlreadyInactive | RevokeOutcome::NotFound => Ok(false),
        }
    }

    /// Blacklist an access token until its natural expiry.
    pub async fn revoke_access_token(
        &self,
        claims: &AccessTokenClaims,
        reason: RevocationReason,
    ) -> Result<(), AuthError> {
        let now = self.clock.now();
        let expires_at = claims.expires_at();
        if expires_at <= now {
            return Ok(());
        }

        let entry = BlacklistEntry::new(
            claims.jti.clone(),
            claims.sub,
            TokenType::Access,
            expires_at,
            reason,
            now,
        );
        self.timed("blacklist", self.store.blacklist(&entry)).await?;

        metrics::record_token_event("access_revoked");
        self.auditor
            .record(
                AuditEvent::new(AuditAction::AccessTokenRevoked, AuditSeverity::Info, now)
                    .principal(claims.sub)
                    .with("session_id", claims.sid.to_string())
                    .with("reason", reason.as_str()),
            )
            .await;
        Ok(())
    }

    /// Revoke every session of a principal. Transient failures are retried;
    /// a final failure is audited as critical and returned.
    pub async fn revoke_all_for_principal(
        &self,
        principal_id: Uuid,
        reason: RevocationReason,
    ) -> Result<u64, AuthError> {
        let now = self.clock.now();

        let result = retry_with_backoff(
            &self.settings.bulk_retry,
            "revoke_all_for_principal",
            || {
                self.timed(
                    "revoke_all_for_principal",
                    self.store.revoke_all_for_principal(principal_id, reason, now),
                )
            },
        )
        .await;

        match result {
            Ok(revoked) => {
                metrics::record_token_event("revoked_all");
                tracing::info!(principal_id = %principal_id, revoked, reason = %reason, "Revoked all sessions");
                self.auditor
                    .record(
                        AuditEvent::new(AuditAction::AllSessionsRevoked, AuditSeverity::Warning, now)
                            .principal(principal_id)
                            .with("revoked", revoked)
                            .with("reason", reason.as_str()),
                    )
                    .await;
                Ok(revoked)
            }
            Err(e) => {
                tracing::error!(principal_id = %principal_id, error = %e, "Bulk revocation failed");
                self.auditor
                    .record(
                        AuditEvent::new(
                            AuditAction::BulkRevocationFailed,
                            AuditSeverity::Critical,
                            now,
                        )
                        .principal(principal_id)
                        .with("reason", reason.as_str())
                        .with("error", e.to_string()),
                    )
                    .await;
                Err(e.into())
            }
        }
    }

    pub async fn list_sessions(&self, principal_id: Uuid) -> Result<Vec<SessionInfo>, AuthError> {
        let sessions = self
            .timed(
                "list_active_sessions",
                self.store.list_active_sessions(principal_id),
            )
            .await?;
        Ok(sessions.into_iter().map(SessionInfo::from).collect())
    }

    /// End one of the principal's sessions. False if it was not active.
    pub async fn revoke_session(
        &self,
        principal_id: Uuid,
        session_id: Uuid,
    ) -> Result<bool, AuthError> {
        let now = self.clock.now();
        let ended = self
            .timed(
                "revoke_session",
                self.store.revoke_session(
                    principal_id,
                    session_id,
                    RevocationReason::SessionRevoked,
                    now,
                ),
            )
            .await?;

        if ended {
            metrics::record_token_event("session_revoked");
            self.auditor
                .record(
                    AuditEvent::new(AuditAction::SessionRevoked, AuditSeverity::Info, now)
                        .principal(principal_id)
                        .with("session_id", session_id.to_string()),
                )
                .await;
        }
        Ok(ended)
    }

    async fn replay_detected(
        &self,
        record: &RefreshTokenRecord,
        device: &DeviceInfo,
        signal: &str,
        now: DateTime<Utc>,
    ) {
        metrics::record_token_event("replay_detected");
        tracing::warn!(
            principal_id = %record.principal_id,
            session_id = %record.session_id,
            signal,
            "Refresh token replay detected"
        );
        self.auditor
            .record(
                AuditEvent::new(AuditAction::ReplayDetected, AuditSeverity::Critical, now)
                    .principal(record.principal_id)
                    .ip(device.ip_address.as_deref())
                    .with("session_id", record.session_id.to_string())
                    .with("signal", signal)
                    .with("rotation_count", record.rotation_count),
            )
            .await;
    }

    async fn clone_suspected(
        &self,
        claims: &RefreshTokenClaims,
        device: &DeviceInfo,
        signal: &str,
        now: DateTime<Utc>,
    ) {
        metrics::record_token_event("clone_suspected");
        tracing::warn!(
            principal_id = %claims.sub,
            session_id = %claims.sid,
            signal,
            "Refresh token does not match any stored record"
        );
        self.auditor
            .record(
                AuditEvent::new(AuditAction::TokenCloneSuspected, AuditSeverity::Critical, now)
                    .principal(claims.sub)
                    .ip(device.ip_address.as_deref())
                    .with("session_id", claims.sid.to_string())
                    .with("signal", signal),
            )
            .await;
    }

    async fn device_mismatch(
        &self,
        record: &RefreshTokenRecord,
        device: &DeviceInfo,
        now: DateTime<Utc>,
    ) {
        tracing::warn!(
            principal_id = %record.principal_id,
            session_id = %record.session_id,
            strict = self.settings.strict_device_binding,
            "Refresh presented from a different device"
        );
        self.auditor
            .record(
                AuditEvent::new(AuditAction::DeviceMismatch, AuditSeverity::Warning, now)
                    .principal(record.principal_id)
                    .ip(device.ip_address.as_deref())
                    .with("session_id", record.session_id.to_string())
                    .with("strict", self.settings.strict_device_binding),
            )
            .await;
    }
}

fn pair(minted: Minted) -> TokenPair {
    TokenPair {
        access_token: minted.access_token,
        refresh_token: minted.refresh_token,
        token_type: "Bearer".to_string(),
        expires_at: minted.access_claims.expires_at(),
        refresh_expires_at: minted.refresh_claims.expires_at(),
        session_id: minted.refresh_claims.sid,
    }
}

fn signing_failure(err: anyhow::Error) -> AuthError {
    tracing::error!(error = %err, "Failed to sign token");
    AuthError::StoreUnavailable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JwtConfig;
    use crate::services::audit::MemoryAuditSink;
    use crate::store::MemoryStore;
    use crate::utils::ManualClock;
    use chrono::Duration as ChronoDuration;
    use secrecy::SecretString;

    struct Fixture {
        manager: TokenManager,
        store: Arc<MemoryStore>,
        sink: Arc<MemoryAuditSink>,
        clock: ManualClock,
    }

    fn fixture(strict_device_binding: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemoryAuditSink::new());
        let clock = ManualClock::new(Utc::now());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let jwt = JwtService::new(&JwtConfig::new(
            "access-secret-for-token-manager-tests",
            "refresh-secret-for-token-manager-tests",
            "auth-core-test",
        ))
        .unwrap();
        let resolver = RbacResolver::new(store.clone(), shared_clock.clone(), Duration::from_secs(1));
        let fingerprinter =
            DeviceFingerprinter::new(&SecretString::new("fingerprint-secret".to_string())).unwrap();
        let auditor = Auditor::new(sink.clone(), Duration::from_secs(1));
        let manager = TokenManager::new(
            store.clone(),
            jwt,
            resolver,
            fingerprinter,
            auditor,
            shared_clock,
            TokenManagerSettings {
                strict_device_binding,
                bulk_retry: RetryConfig::no_retry(),
                ..Default::default()
            },
        );
        Fixture {
            manager,
            store,
            sink,
            clock,
        }
    }

    fn laptop() -> DeviceInfo {
        DeviceInfo::new("10.0.0.1", "Mozilla/5.0 (X11; Linux x86_64)")
    }

    #[tokio::test]
    async fn test_issue_and_validate() {
        let f = fixture(false);
        let principal = Uuid::new_v4();
        let pair = f
            .manager
            .create_token_pair(principal, &laptop(), false)
            .await
            .unwrap();

        let claims = f.manager.validate_access_token(&pair.access_token).await.unwrap();
        assert_eq!(claims.sub, principal);
        assert_eq!(claims.sid, pair.session_id);
        assert_eq!(
            pair.refresh_expires_at.timestamp(),
            (f.clock.now() + ChronoDuration::days(7)).timestamp()
        );
    }

    #[tokio::test]
    async fn test_rotation_issues_new_jti_and_rejects_old() {
        let f = fixture(false);
        let pair = f
            .manager
            .create_token_pair(Uuid::new_v4(), &laptop(), true)
            .await
            .unwrap();

        f.clock.advance(ChronoDuration::minutes(20));
        let rotated = f
            .manager
            .refresh_token_pair(&pair.refresh_token, &laptop())
            .await
            .unwrap();
        assert_ne!(rotated.refresh_token, pair.refresh_token);
        assert_eq!(rotated.session_id, pair.session_id);
        assert_eq!(
            rotated.refresh_expires_at.timestamp(),
            (f.clock.now() + ChronoDuration::days(30)).timestamp()
        );

        let replay = f
            .manager
            .refresh_token_pair(&pair.refresh_token, &laptop())
            .await;
        assert_eq!(replay.unwrap_err(), AuthError::ReplayDetected);
        assert_eq!(f.sink.count(AuditAction::ReplayDetected), 1);
    }

    #[tokio::test]
    async fn test_blacklisted_access_token_is_invalid() {
        let f = fixture(false);
        let pair = f
            .manager
            .create_token_pair(Uuid::new_v4(), &laptop(), false)
            .await
            .unwrap();
        let claims = f.manager.validate_access_token(&pair.access_token).await.unwrap();

        f.manager
            .revoke_access_token(&claims, RevocationReason::Logout)
            .await
            .unwrap();
        assert_eq!(
            f.manager.validate_access_token(&pair.access_token).await.unwrap_err(),
            AuthError::TokenInvalid
        );
    }

    #[tokio::test]
    async fn test_validation_fails_closed_when_store_is_down() {
        let f = fixture(false);
        let pair = f
            .manager
            .create_token_pair(Uuid::new_v4(), &laptop(), false)
            .await
            .unwrap();

        f.store.set_unavailable(true);
        assert_eq!(
            f.manager.validate_access_token(&pair.access_token).await.unwrap_err(),
            AuthError::TokenInvalid
        );
        assert_eq!(
            f.manager
                .refresh_token_pair(&pair.refresh_token, &laptop())
                .await
                .unwrap_err(),
            AuthError::StoreUnavailable
        );
    }

    #[tokio::test]
    async fn test_strict_device_binding_rejects_other_device() {
        let f = fixture(true);
        let pair = f
            .manager
            .create_token_pair(Uuid::new_v4(), &laptop(), false)
            .await
            .unwrap();

        let phone = DeviceInfo::new("192.168.1.9", "Mobile Safari");
        let result = f.manager.refresh_token_pair(&pair.refresh_token, &phone).await;
        assert_eq!(result.unwrap_err(), AuthError::TokenInvalid);
        assert_eq!(f.sink.count(AuditAction::DeviceMismatch), 1);

        assert!(f
            .manager
            .refresh_token_pair(&pair.refresh_token, &laptop())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_lenient_device_binding_only_audits() {
        let f = fixture(false);
        let pair = f
            .manager
            .create_token_pair(Uuid::new_v4(), &laptop(), false)
            .await
            .unwrap();

        let phone = DeviceInfo::new("192.168.1.9", "Mobile Safari");
        assert!(f
            .manager
            .refresh_token_pair(&pair.refresh_token, &phone)
            .await
            .is_ok());
        assert_eq!(f.sink.count(AuditAction::DeviceMismatch), 1);
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let f = fixture(false);
        let pair = f
            .manager
            .create_token_pair(Uuid::new_v4(), &laptop(), false)
            .await
            .unwrap();

        assert!(f
            .manager
            .revoke_refresh_token(&pair.refresh_token, RevocationReason::Logout)
            .await
            .unwrap());
        assert!(!f
            .manager
            .revoke_refresh_token(&pair.refresh_token, RevocationReason::Logout)
            .await
            .unwrap());
        assert!(!f
            .manager
            .revoke_refresh_token("not-a-token", RevocationReason::Logout)
            .await
            .unwrap());

        let session = f.store.find_session(pair.session_id).await.unwrap().unwrap();
        assert!(!session.is_active);
    }

    #[tokio::test]
    async fn test_bulk_revocation_failure_is_audited() {
        let f = fixture(false);
        let principal = Uuid::new_v4();
        f.manager
            .create_token_pair(principal, &laptop(), false)
            .await
            .unwrap();

        f.store.set_unavailable(true);
        let result = f
            .manager
            .revoke_all_for_principal(principal, RevocationReason::LogoutAll)
            .await;
        assert_eq!(result.unwrap_err(), AuthError::StoreUnavailable);
        assert_eq!(f.sink.count(AuditAction::BulkRevocationFailed), 1);
    }
}
