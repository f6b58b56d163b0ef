use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::RevocationReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

impl FromStr for TokenType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access" => Ok(TokenType::Access),
            "refresh" => Ok(TokenType::Refresh),
            _ => Err(format!("Invalid token type: {}", s)),
        }
    }
}

/// A revoked token identifier. Kept only until the token would have expired
/// anyway, so the table stays bounded.
#[derive(Debug, Clone)]
pub struct BlacklistEntry {
    pub jti: String,
    pub principal_id: Uuid,
    pub token_type: TokenType,
    pub expires_at: DateTime<Utc>,
    pub reason: RevocationReason,
    pub created_at: DateTime<Utc>,
}

impl BlacklistEntry {
    pub fn new(
        jti: impl Into<String>,
        principal_id: Uuid,
        token_type: TokenType,
        expires_at: DateTime<Utc>,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            jti: jti.into(),
            principal_id,
            token_type,
            expires_at,
            reason,
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
