use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Per-identifier failure counter and lockout window.
///
/// Keyed by the normalized identifier rather than the principal id so that
/// unknown identifiers accumulate state exactly like known ones.
///
/// `prior_lockouts` counts lockouts that ran out since the last successful
/// authentication. Expiry clears the counter and window but bumps it, so the
/// next lockout lands further along the schedule.
#[derive(Debug, Clone, FromRow)]
pub struct AccountSecurityRecord {
    pub identifier: String,
    pub principal_id: Option<Uuid>,
    pub failed_attempts: i32,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub prior_lockouts: i32,
    pub suspicious_activity: bool,
    pub updated_at: DateTime<Utc>,
}

impl AccountSecurityRecord {
    pub fn new(identifier: impl Into<String>, principal_id: Option<Uuid>, now: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.into(),
            principal_id,
            failed_attempts: 0,
            last_failed_at: None,
            locked_until: None,
            prior_lockouts: 0,
            suspicious_activity: false,
            updated_at: now,
        }
    }

    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// A lockout was set and its window has passed.
    pub fn lockout_elapsed_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until <= now)
    }
}
