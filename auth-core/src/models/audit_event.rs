//! Audit event model - security and compliance logging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit actions raised by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    LoginSucceeded,
    LoginFailed,
    LoginLocked,
    AccountLockedOut,
    SuspiciousActivity,
    LockoutCheckFailed,
    TokenPairIssued,
    TokenRotated,
    TokenRevoked,
    AccessTokenRevoked,
    SessionRevoked,
    AllSessionsRevoked,
    BulkRevocationFailed,
    ReplayDetected,
    TokenCloneSuspected,
    DeviceMismatch,
    PermissionDenied,
    CleanupCompleted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::LoginSucceeded => "login_succeeded",
            AuditAction::LoginFailed => "login_failed",
            AuditAction::LoginLocked => "login_locked",
            AuditAction::AccountLockedOut => "account_locked_out",
            AuditAction::SuspiciousActivity => "suspicious_activity",
            AuditAction::LockoutCheckFailed => "lockout_check_failed",
            AuditAction::TokenPairIssued => "token_pair_issued",
            AuditAction::TokenRotated => "token_rotated",
            AuditAction::TokenRevoked => "token_revoked",
            AuditAction::AccessTokenRevoked => "access_token_revoked",
            AuditAction::SessionRevoked => "session_revoked",
            AuditAction::AllSessionsRevoked => "all_sessions_revoked",
            AuditAction::BulkRevocationFailed => "bulk_revocation_failed",
            AuditAction::ReplayDetected => "replay_detected",
            AuditAction::TokenCloneSuspected => "token_clone_suspected",
            AuditAction::DeviceMismatch => "device_mismatch",
            AuditAction::PermissionDenied => "permission_denied",
            AuditAction::CleanupCompleted => "cleanup_completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::Critical => "critical",
        }
    }
}

/// Audit event entity.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub action: AuditAction,
    pub principal_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub metadata: serde_json::Value,
    pub severity: AuditSeverity,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, severity: AuditSeverity, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            principal_id: None,
            ip_address: None,
            metadata: serde_json::Value::Object(Default::default()),
            severity,
            created_at: now,
        }
    }

    pub fn principal(mut self, principal_id: Uuid) -> Self {
        self.principal_id = Some(principal_id);
        self
    }

    pub fn ip(mut self, ip_address: Option<&str>) -> Self {
        self.ip_address = ip_address.map(str::to_string);
        self
    }

    /// Attach a metadata field. Non-object metadata is replaced.
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if !self.metadata.is_object() {
            self.metadata = serde_json::Value::Object(Default::default());
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.to_string(), value.into());
        }
        self
    }
}
