//! Principal model - the identity every token and lockout record hangs off.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Principal entity. Soft-deleted via `deleted_at`, never removed.
#[derive(Debug, Clone, FromRow)]
pub struct Principal {
    pub id: Uuid,
    pub email: String,
    pub is_active: bool,
    /// `None` for principals that only sign in through a federated identity.
    pub password_hash: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Principal {
    /// Create a new principal.
    pub fn new(email: impl AsRef<str>, password_hash: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: normalize_email(email.as_ref()),
            is_active: true,
            password_hash,
            deleted_at: None,
            created_at: now,
        }
    }

    /// Active and not tombstoned.
    pub fn can_authenticate(&self) -> bool {
        self.is_active && self.deleted_at.is_none()
    }

    pub fn is_federated_only(&self) -> bool {
        self.password_hash.is_none()
    }
}

/// Canonical form used for lookups and lockout identifiers.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
