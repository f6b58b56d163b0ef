//! Role assignment model - optionally time-bounded principal→role grants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Role assignment entity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RoleAssignment {
    pub id: Uuid,
    pub principal_id: Uuid,
    pub role_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl RoleAssignment {
    /// Create a new open-ended assignment.
    pub fn new(
        principal_id: Uuid,
        role_id: Uuid,
        organization_id: Option<Uuid>,
        granted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal_id,
            role_id,
            organization_id,
            granted_at,
            expires_at: None,
            is_active: true,
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Expiry is enforced lazily, here, at resolution time.
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.granted_at <= now && self.expires_at.is_none_or(|end| end > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_assignment_expiry() {
        let now = Utc::now();
        let assignment = RoleAssignment::new(Uuid::new_v4(), Uuid::new_v4(), None, now)
            .expiring_at(now + Duration::hours(1));
        assert!(assignment.is_effective(now));
        assert!(!assignment.is_effective(now + Duration::hours(2)));
    }

    #[test]
    fn test_inactive_or_future_assignment_is_not_effective() {
        let now = Utc::now();
        let mut assignment = RoleAssignment::new(Uuid::new_v4(), Uuid::new_v4(), None, now);
        assignment.is_active = false;
        assert!(!assignment.is_effective(now));

        let future =
            RoleAssignment::new(Uuid::new_v4(), Uuid::new_v4(), None, now + Duration::days(1));
        assert!(!future.is_effective(now));
    }
}
