use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Internal reason code for a failed attempt. Never shown to the caller, who
/// only ever sees a uniform credential failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailureReason {
    InvalidInput,
    UnknownPrincipal,
    InactivePrincipal,
    NoPasswordSet,
    BadPassword,
    AccountLocked,
    TokenIssuance,
}

impl LoginFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginFailureReason::InvalidInput => "invalid_input",
            LoginFailureReason::UnknownPrincipal => "unknown_principal",
            LoginFailureReason::InactivePrincipal => "inactive_principal",
            LoginFailureReason::NoPasswordSet => "no_password_set",
            LoginFailureReason::BadPassword => "bad_password",
            LoginFailureReason::AccountLocked => "account_locked",
            LoginFailureReason::TokenIssuance => "token_issuance",
        }
    }
}

/// Append-only authentication journal row.
#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub id: Uuid,
    pub email: String,
    pub principal_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub device_fingerprint: String,
    pub success: bool,
    pub failure_reason: Option<LoginFailureReason>,
    pub session_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl LoginAttempt {
    pub fn succeeded(
        email: impl Into<String>,
        principal_id: Uuid,
        ip_address: Option<String>,
        device_fingerprint: impl Into<String>,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            principal_id: Some(principal_id),
            ip_address,
            device_fingerprint: device_fingerprint.into(),
            success: true,
            failure_reason: None,
            session_id: Some(session_id),
            created_at: now,
        }
    }

    pub fn failed(
        email: impl Into<String>,
        principal_id: Option<Uuid>,
        ip_address: Option<String>,
        device_fingerprint: impl Into<String>,
        reason: LoginFailureReason,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            principal_id,
            ip_address,
            device_fingerprint: device_fingerprint.into(),
            success: false,
            failure_reason: Some(reason),
            session_id: None,
            created_at: now,
        }
    }
}
