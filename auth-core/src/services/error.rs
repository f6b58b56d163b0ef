use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Failures that cross the core's boundary.
///
/// Display strings are deliberately coarse; detail goes to logs and audit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Wrong password, unknown principal or inactive principal.
    #[error("Invalid credentials")]
    InvalidCredential,

    #[error("Account locked")]
    AccountLocked { locked_until: DateTime<Utc> },

    /// Expired, malformed, badly signed or blacklisted token.
    #[error("Invalid token")]
    TokenInvalid,

    /// Refresh token reuse. Collapsed into `TokenInvalid` by [`AuthError::external`].
    #[error("Invalid token")]
    ReplayDetected,

    #[error("Access denied")]
    PermissionDenied {
        permission: String,
        resource_id: Option<Uuid>,
    },

    /// Transient infrastructure failure; safe to retry with backoff.
    #[error("Service temporarily unavailable")]
    StoreUnavailable,
}

impl AuthError {
    /// The form handed to callers: replay is indistinguishable from any other
    /// invalid token.
    pub fn external(self) -> Self {
        match self {
            AuthError::ReplayDetected => AuthError::TokenInvalid,
            other => other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::StoreUnavailable)
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::Unavailable(_) => tracing::warn!(error = %err, "Store unavailable"),
            _ => tracing::error!(error = %err, "Store failure"),
        }
        AuthError::StoreUnavailable
    }
}
