//! Session model - one login on one device, surviving many rotations.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::RevocationReason;

/// Session entity.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub principal_id: Uuid,
    /// Updated in place on every rotation.
    pub current_refresh_token_id: Uuid,
    pub device_fingerprint: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub is_active: bool,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<RevocationReason>,
}

impl Session {
    /// End the session. Returns false if it had already ended.
    pub fn end(&mut self, reason: RevocationReason, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        self.is_active = false;
        self.ended_at = Some(now);
        self.end_reason = Some(reason);
        true
    }
}

/// Session info for "manage devices" listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub device_fingerprint: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl From<Session> for SessionInfo {
    fn from(s: Session) -> Self {
        Self {
            session_id: s.id,
            device_fingerprint: s.device_fingerprint,
            ip_address: s.ip_address,
            user_agent: s.user_agent,
            created_at: s.created_at,
            last_activity_at: s.last_activity_at,
        }
    }
}
