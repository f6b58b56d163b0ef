//! The exposed surface: authentication, refresh, logout and authorization.
//!
//! Every error leaving this module has been passed through
//! [`AuthError::external`].

use secrecy::SecretString;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{AuthConfig, JwtConfig, LockoutConfig};
use crate::models::{
    normalize_email, AuditAction, AuditEvent, AuditSeverity, LoginAttempt, LoginFailureReason,
    Permission, Principal, RevocationReason, SessionInfo,
};
use crate::services::account_guard::AccountSecurityGuard;
use crate::services::audit::{AuditSink, Auditor};
use crate::services::cleanup::CleanupSweeper;
use crate::services::error::AuthError;
use crate::services::jwt::{AccessTokenClaims, JwtService};
use crate::services::rbac::{
    AccessTarget, Decision, EffectivePermissions, PermissionCache, RbacResolver, ScopeFilter,
};
use crate::services::token_manager::{TokenManager, TokenManagerSettings, TokenPair};
use crate::store::{with_timeout, AuthStore, SecurityStore, StoreError, UserStore};
use crate::utils::{
    Clock, CredentialVerifier, DeviceFingerprinter, DeviceInfo, Password, PasswordLoginInput,
};

/// Everything the service needs from configuration.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub jwt: JwtConfig,
    pub lockout: LockoutConfig,
    pub fingerprint_secret: SecretString,
    pub strict_device_binding: bool,
    pub store_timeout: Duration,
    pub audit_timeout: Duration,
}

impl AuthSettings {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            jwt: config.jwt.clone(),
            lockout: config.lockout.clone(),
            fingerprint_secret: config.security.fingerprint_secret.clone(),
            strict_device_binding: config.security.strict_device_binding,
            store_timeout: config.database.store_timeout,
            audit_timeout: config.security.audit_timeout,
        }
    }
}

/// Who an authorization question is about.
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    /// Use the snapshot embedded in a validated access token.
    Claims(&'a AccessTokenClaims),
    /// Resolve permissions from the store.
    Principal(Uuid),
}

#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserStore>,
    journal: Arc<dyn SecurityStore>,
    guard: AccountSecurityGuard,
    tokens: TokenManager,
    resolver: RbacResolver,
    sweeper: CleanupSweeper,
    verifier: CredentialVerifier,
    fingerprinter: DeviceFingerprinter,
    auditor: Auditor,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl AuthService {
    /// Wire every component against one store.
    pub fn new<S>(
        store: Arc<S>,
        settings: AuthSettings,
        verifier: CredentialVerifier,
        audit_sink: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        permission_cache: Option<Arc<dyn PermissionCache>>,
    ) -> Result<Self, anyhow::Error>
    where
        S: AuthStore + 'static,
    {
        let auditor = Auditor::new(audit_sink, settings.audit_timeout);
        let jwt = JwtService::new(&settings.jwt)?;
        let fingerprinter = DeviceFingerprinter::new(&settings.fingerprint_secret)?;

        let mut resolver = RbacResolver::new(store.clone(), clock.clone(), settings.store_timeout);
        if let Some(cache) = permission_cache {
            resolver = resolver.with_cache(cache);
        }

        let guard = AccountSecurityGuard::new(
            store.clone(),
            auditor.clone(),
            clock.clone(),
            settings.lockout.clone(),
            settings.store_timeout,
        );

        let tokens = TokenManager::new(
            store.clone(),
            jwt,
            resolver.clone(),
            fingerprinter.clone(),
            auditor.clone(),
            clock.clone(),
            TokenManagerSettings {
                store_timeout: settings.store_timeout,
                strict_device_binding: settings.strict_device_binding,
                ..Default::default()
            },
        );

        let sweeper = CleanupSweeper::new(
            store.clone(),
            guard.clone(),
            auditor.clone(),
            clock.clone(),
            settings.store_timeout,
        );

        Ok(Self {
            users: store.clone(),
            journal: store,
            guard,
            tokens,
            resolver,
            sweeper,
            verifier,
            fingerprinter,
            auditor,
            clock,
            store_timeout: settings.store_timeout,
        })
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn resolver(&self) -> &RbacResolver {
        &self.resolver
    }

    pub fn guard(&self) -> &AccountSecurityGuard {
        &self.guard
    }

    pub fn sweeper(&self) -> CleanupSweeper {
        self.sweeper.clone()
    }

    /// Password login.
    ///
    /// Unknown, inactive and federated-only principals, bad input and locked
    /// accounts all cost one password verification, and all count toward the
    /// identifier's lockout.
    pub async fn authenticate_with_password(
        &self,
        email: &str,
        password: &str,
        device: &DeviceInfo,
        remember_me: bool,
    ) -> Result<TokenPair, AuthError> {
        let now = self.clock.now();
        let input = PasswordLoginInput::new(email, password);
        let identifier = normalize_email(&input.email);
        let password = Password::new(input.password.clone());
        let fingerprint = self.fingerprinter.fingerprint(device);
        let ip = device.ip_address.as_deref();

        if !input.is_valid() {
            self.burn_dummy(&password).await;
            self.record_attempt(LoginAttempt::failed(
                identifier,
                None,
                device.ip_address.clone(),
                fingerprint,
                LoginFailureReason::InvalidInput,
                now,
            ))
            .await;
            return Err(AuthError::InvalidCredential);
        }

        let status = self.guard.is_locked(&identifier).await;
        if let (true, Some(locked_until)) = (status.locked, status.locked_until) {
            self.burn_dummy(&password).await;
            self.record_attempt(LoginAttempt::failed(
                identifier.as_str(),
                None,
                device.ip_address.clone(),
                fingerprint,
                LoginFailureReason::AccountLocked,
                now,
            ))
            .await;
            self.auditor
                .record(
                    AuditEvent::new(AuditAction::LoginLocked, AuditSeverity::Warning, now)
                        .ip(ip)
                        .with("identifier", identifier)
                        .with("locked_until", locked_until.to_rfc3339()),
                )
                .await;
            return Err(AuthError::AccountLocked { locked_until });
        }

        let principal = with_timeout(
            self.store_timeout,
            "find_principal_by_email",
            self.users.find_principal_by_email(&identifier),
        )
        .await
        .map_err(|e| AuthError::from(e).external())?;

        let checked = self.check_password(principal.as_ref(), &password).await;
        let principal = match (checked, principal) {
            (Ok(()), Some(principal)) => principal,
            (checked, principal) => {
                let reason = checked
                    .err()
                    .unwrap_or(LoginFailureReason::UnknownPrincipal);
                return Err(self
                    .login_failed(&identifier, principal.map(|p| p.id), device, &fingerprint, reason)
                    .await);
            }
        };

        self.guard.clear(&identifier).await;
        self.maybe_upgrade_hash(&principal, &password).await;

        let pair = match self
            .tokens
            .create_token_pair(principal.id, device, remember_me)
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                self.record_attempt(LoginAttempt::failed(
                    identifier,
                    Some(principal.id),
                    device.ip_address.clone(),
                    fingerprint,
                    LoginFailureReason::TokenIssuance,
                    now,
                ))
                .await;
                return Err(e.external());
            }
        };

        self.record_attempt(LoginAttempt::succeeded(
            identifier,
            principal.id,
            device.ip_address.clone(),
            fingerprint,
            pair.session_id,
            now,
        ))
        .await;
        self.auditor
            .record(
                AuditEvent::new(AuditAction::LoginSucceeded, AuditSeverity::Info, now)
                    .principal(principal.id)
                    .ip(ip)
                    .with("method", "password")
                    .with("session_id", pair.session_id.to_string()),
            )
            .await;

        Ok(pair)
    }

    /// Issue tokens for an identity already proven by a federated verifier.
    /// Lockout does not apply; a successful federated login clears it.
    pub async fn authenticate_with_verified_identity(
        &self,
        principal_id: Uuid,
        device: &DeviceInfo,
        remember_me: bool,
    ) -> Result<TokenPair, AuthError> {
        let now = self.clock.now();
        let fingerprint = self.fingerprinter.fingerprint(device);

        let principal = with_timeout(
            self.store_timeout,
            "find_principal",
            self.users.find_principal(principal_id),
        )
        .await
        .map_err(|e| AuthError::from(e).external())?;

        let principal = match principal {
            Some(p) if p.can_authenticate() => p,
            other => {
                let reason = if other.is_some() {
                    LoginFailureReason::InactivePrincipal
                } else {
                    LoginFailureReason::UnknownPrincipal
                };
                self.record_attempt(LoginAttempt::failed(
                    other.map(|p| p.email).unwrap_or_default(),
                    Some(principal_id),
                    device.ip_address.clone(),
                    fingerprint,
                    reason,
                    now,
                ))
                .await;
                return Err(AuthError::InvalidCredential);
            }
        };

        let pair = self
            .tokens
            .create_token_pair(principal.id, device, remember_me)
            .await
            .map_err(AuthError::external)?;

        self.guard.clear(&normalize_email(&principal.email)).await;
        self.record_attempt(LoginAttempt::succeeded(
            principal.email.as_str(),
            principal.id,
            device.ip_address.clone(),
            fingerprint,
            pair.session_id,
            now,
        ))
        .await;
        self.auditor
            .record(
                AuditEvent::new(AuditAction::LoginSucceeded, AuditSeverity::Info, now)
                    .principal(principal.id)
                    .ip(device.ip_address.as_deref())
                    .with("method", "verified_identity")
                    .with("session_id", pair.session_id.to_string()),
            )
            .await;

        Ok(pair)
    }

    pub async fn refresh(
        &self,
        refresh_token: &str,
        device: &DeviceInfo,
    ) -> Result<TokenPair, AuthError> {
        self.tokens
            .refresh_token_pair(refresh_token, device)
            .await
            .map_err(AuthError::external)
    }

    /// End the session behind `refresh_token`. When the caller's access token
    /// claims are supplied, that token is blacklisted too. Repeating a logout
    /// is a no-op.
    pub async fn logout(
        &self,
        refresh_token: &str,
        access_claims: Option<&AccessTokenClaims>,
    ) -> Result<(), AuthError> {
        self.tokens
            .revoke_refresh_token(refresh_token, RevocationReason::Logout)
            .await
            .map_err(AuthError::external)?;

        if let Some(claims) = access_claims {
            self.tokens
                .revoke_access_token(claims, RevocationReason::Logout)
                .await
                .map_err(AuthError::external)?;
        }
        Ok(())
    }

    pub async fn logout_all(
        &self,
        principal_id: Uuid,
        reason: RevocationReason,
    ) -> Result<u64, AuthError> {
        self.tokens
            .revoke_all_for_principal(principal_id, reason)
            .await
            .map_err(AuthError::external)
    }

    pub async fn validate_access_token(&self, token: &str) -> Result<AccessTokenClaims, AuthError> {
        self.tokens
            .validate_access_token(token)
            .await
            .map_err(AuthError::external)
    }

    /// Allow, or `PermissionDenied` carrying the permission and target for
    /// audit.
    pub async fn authorize(
        &self,
        subject: Subject<'_>,
        permission: &Permission,
        target: AccessTarget,
    ) -> Result<(), AuthError> {
        let (principal_id, effective) = self.subject_permissions(subject).await?;
        let decision = RbacResolver::decide(&effective, principal_id, permission, target);

        match decision {
            Decision::Allow { .. } => Ok(()),
            Decision::Deny(reason) => {
                let resource_id = target.organization_id.or(target.owner_id);
                tracing::info!(
                    principal_id = %principal_id,
                    permission = %permission,
                    reason = reason.as_str(),
                    "Permission denied"
                );
                let mut event = AuditEvent::new(
                    AuditAction::PermissionDenied,
                    AuditSeverity::Info,
                    self.clock.now(),
                )
                .principal(principal_id)
                .with("permission", permission.name())
                .with("reason", reason.as_str());
                if let Some(id) = resource_id {
                    event = event.with("resource_id", id.to_string());
                }
                self.auditor.record(event).await;

                Err(AuthError::PermissionDenied {
                    permission: permission.name(),
                    resource_id,
                })
            }
        }
    }

    /// Row predicate for list-style queries on `resource:action`.
    pub async fn scope_filter(
        &self,
        subject: Subject<'_>,
        resource: &str,
        action: &str,
    ) -> Result<ScopeFilter, AuthError> {
        let (principal_id, effective) = self.subject_permissions(subject).await?;
        Ok(ScopeFilter::for_operation(
            &effective,
            principal_id,
            resource,
            action,
        ))
    }

    pub async fn list_sessions(&self, principal_id: Uuid) -> Result<Vec<SessionInfo>, AuthError> {
        self.tokens
            .list_sessions(principal_id)
            .await
            .map_err(AuthError::external)
    }

    pub async fn revoke_session(
        &self,
        principal_id: Uuid,
        session_id: Uuid,
    ) -> Result<bool, AuthError> {
        self.tokens
            .revoke_session(principal_id, session_id)
            .await
            .map_err(AuthError::external)
    }

    /// A token's snapshot is trusted until an assignment it was built from
    /// starts or expires; past that it is resolved again.
    async fn subject_permissions<'a>(
        &self,
        subject: Subject<'a>,
    ) -> Result<(Uuid, Cow<'a, EffectivePermissions>), AuthError> {
        match subject {
            Subject::Claims(claims) if !claims.authz.has_lapsed(self.clock.now()) => {
                Ok((claims.sub, Cow::Borrowed(&claims.authz)))
            }
            Subject::Claims(claims) => {
                tracing::debug!(principal_id = %claims.sub, "Token permission snapshot lapsed");
                Ok((claims.sub, Cow::Owned(self.effective(claims.sub).await?)))
            }
            Subject::Principal(principal_id) => {
                Ok((principal_id, Cow::Owned(self.effective(principal_id).await?)))
            }
        }
    }

    async fn effective(&self, principal_id: Uuid) -> Result<EffectivePermissions, AuthError> {
        self.resolver
            .resolve_effective_permissions(principal_id)
            .await
            .map_err(|e: StoreError| AuthError::from(e).external())
    }

    /// Verifies against the stored hash, or a dummy hash when there is none
    /// to check, so every path pays the same cost.
    async fn check_password(
        &self,
        principal: Option<&Principal>,
        password: &Password,
    ) -> Result<(), LoginFailureReason> {
        let Some(principal) = principal else {
            self.burn_dummy(password).await;
            return Err(LoginFailureReason::UnknownPrincipal);
        };
        if !principal.can_authenticate() {
            self.burn_dummy(password).await;
            return Err(LoginFailureReason::InactivePrincipal);
        }
        let Some(hash) = principal.password_hash.clone() else {
            self.burn_dummy(password).await;
            return Err(LoginFailureReason::NoPasswordSet);
        };

        let verifier = self.verifier.clone();
        let password = password.clone();
        let verified = tokio::task::spawn_blocking(move || verifier.verify(&password, &hash))
            .await
            .unwrap_or(false);

        if verified {
            Ok(())
        } else {
            Err(LoginFailureReason::BadPassword)
        }
    }

    async fn burn_dummy(&self, password: &Password) {
        let verifier = self.verifier.clone();
        let password = password.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || verifier.verify_dummy(&password)).await
        {
            tracing::warn!(error = %e, "Dummy verification task failed");
        }
    }

    async fn login_failed(
        &self,
        identifier: &str,
        principal_id: Option<Uuid>,
        device: &DeviceInfo,
        fingerprint: &str,
        reason: LoginFailureReason,
    ) -> AuthError {
        let now = self.clock.now();
        let ip = device.ip_address.as_deref();
        let status = self.guard.record_failure(identifier, principal_id, ip).await;

        self.record_attempt(LoginAttempt::failed(
            identifier,
            principal_id,
            device.ip_address.clone(),
            fingerprint,
            reason,
            now,
        ))
        .await;

        let mut event = AuditEvent::new(AuditAction::LoginFailed, AuditSeverity::Info, now)
            .ip(ip)
            .with("identifier", identifier)
            .with("reason", reason.as_str());
        if let Some(id) = principal_id {
            event = event.principal(id);
        }
        self.auditor.record(event).await;

        match (status.locked, status.locked_until) {
            (true, Some(locked_until)) => AuthError::AccountLocked { locked_until },
            _ => AuthError::InvalidCredential,
        }
    }

    async fn record_attempt(&self, attempt: LoginAttempt) {
        if let Err(e) = with_timeout(
            self.store_timeout,
            "record_login_attempt",
            self.journal.record_login_attempt(&attempt),
        )
        .await
        {
            tracing::warn!(
                email = %attempt.email,
                success = attempt.success,
                error = %e,
                "Failed to record login attempt"
            );
        }
    }

    async fn maybe_upgrade_hash(&self, principal: &Principal, password: &Password) {
        let Some(current) = principal.password_hash.as_deref() else {
            return;
        };
        if !self.verifier.needs_upgrade(current) {
            return;
        }

        let verifier = self.verifier.clone();
        let password = password.clone();
        let hashed = match tokio::task::spawn_blocking(move || verifier.hash(&password)).await {
            Ok(Ok(hash)) => hash,
            Ok(Err(e)) => {
                tracing::warn!(principal_id = %principal.id, error = %e, "Password rehash failed");
                return;
            }
            Err(e) => {
                tracing::warn!(principal_id = %principal.id, error = %e, "Password rehash task failed");
                return;
            }
        };

        match with_timeout(
            self.store_timeout,
            "update_password_hash",
            self.users.update_password_hash(principal.id, hashed.as_str()),
        )
        .await
        {
            Ok(()) => tracing::info!(principal_id = %principal.id, "Upgraded password hash"),
            Err(e) => {
                tracing::warn!(principal_id = %principal.id, error = %e, "Failed to store upgraded password hash")
            }
        }
    }
}
