use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Why a refresh token (and its session) stopped being active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Rotation,
    Logout,
    LogoutAll,
    Expired,
    SessionRevoked,
    Administrative,
    ReplayDetected,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Rotation => "rotation",
            RevocationReason::Logout => "logout",
            RevocationReason::LogoutAll => "logout_all",
            RevocationReason::Expired => "expired",
            RevocationReason::SessionRevoked => "session_revoked",
            RevocationReason::Administrative => "administrative",
            RevocationReason::ReplayDetected => "replay_detected",
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevocationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rotation" => Ok(RevocationReason::Rotation),
            "logout" => Ok(RevocationReason::Logout),
            "logout_all" => Ok(RevocationReason::LogoutAll),
            "expired" => Ok(RevocationReason::Expired),
            "session_revoked" => Ok(RevocationReason::SessionRevoked),
            "administrative" => Ok(RevocationReason::Administrative),
            "replay_detected" => Ok(RevocationReason::ReplayDetected),
            _ => Err(format!("Invalid revocation reason: {}", s)),
        }
    }
}

/// Refresh token record. Holds a hash of the token, never the token itself.
#[derive(Debug, Clone)]
pub struct RefreshTokenRecord {
    /// Unique identifier for the refresh token (jti claim)
    pub id: Uuid,
    pub principal_id: Uuid,
    pub session_id: Uuid,
    /// SHA-256 hash of the signed refresh token
    pub token_hash: String,
    pub device_fingerprint: String,
    pub ip_address: Option<String>,
    /// Lifetime class: standard or "remember me"
    pub remember_me: bool,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub revoked_reason: Option<RevocationReason>,
    pub revoked_at: Option<DateTime<Utc>>,
    /// Number of rotations that led to this record within its session
    pub rotation_count: i32,
}

/// Fields fixed at issuance.
#[derive(Debug, Clone)]
pub struct NewRefreshToken<'a> {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub session_id: Uuid,
    pub token: &'a str,
    pub device_fingerprint: String,
    pub ip_address: Option<String>,
    pub remember_me: bool,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub rotation_count: i32,
}

impl RefreshTokenRecord {
    pub fn issue(new: NewRefreshToken<'_>) -> Self {
        Self {
            id: new.id,
            principal_id: new.principal_id,
            session_id: new.session_id,
            token_hash: Self::hash_token(new.token),
            device_fingerprint: new.device_fingerprint,
            ip_address: new.ip_address,
            remember_me: new.remember_me,
            issued_at: new.issued_at,
            expires_at: new.expires_at,
            last_used_at: None,
            is_active: true,
            revoked_reason: None,
            revoked_at: None,
            rotation_count: new.rotation_count,
        }
    }

    /// Hash a token using SHA-256
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Constant-time comparison of the stored hash against a presented token.
    pub fn matches_token(&self, token: &str) -> bool {
        let presented = Self::hash_token(token);
        presented
            .as_bytes()
            .ct_eq(self.token_hash.as_bytes())
            .into()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Active and not past its stored expiry.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now)
    }

    /// Flip to inactive. Returns false if it already was.
    pub fn deactivate(&mut self, reason: RevocationReason, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        self.is_active = false;
        self.revoked_reason = Some(reason);
        self.revoked_at = Some(now);
        true
    }
}
