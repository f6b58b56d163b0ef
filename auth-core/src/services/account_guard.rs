//! Progressive lockout against password guessing.
//!
//! State is keyed by normalized identifier, so unknown identifiers lock out
//! exactly like known ones. Every storage failure fails open (not locked) and
//! is audited.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::LockoutConfig;
use crate::models::{AuditAction, AuditEvent, AuditSeverity};
use crate::services::audit::Auditor;
use crate::services::metrics;
use crate::store::{with_timeout, SecurityStore, StoreError};
use crate::utils::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockStatus {
    pub locked: bool,
    pub locked_until: Option<DateTime<Utc>>,
}

impl LockStatus {
    pub fn unlocked() -> Self {
        Self::default()
    }

    pub fn locked_until(until: DateTime<Utc>) -> Self {
        Self {
            locked: true,
            locked_until: Some(until),
        }
    }
}

#[derive(Clone)]
pub struct AccountSecurityGuard {
    store: Arc<dyn SecurityStore>,
    auditor: Auditor,
    clock: Arc<dyn Clock>,
    config: LockoutConfig,
    store_timeout: std::time::Duration,
}

impl AccountSecurityGuard {
    pub fn new(
        store: Arc<dyn SecurityStore>,
        auditor: Auditor,
        clock: Arc<dyn Clock>,
        config: LockoutConfig,
        store_timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            auditor,
            clock,
            config,
            store_timeout,
        }
    }

    /// Lockout length for `failures` failures in the current episode after
    /// `prior_lockouts` earlier lockouts ran out, or `None` below the
    /// threshold. Each earlier lockout moves one step along the schedule,
    /// clamped at the last entry.
    pub fn lockout_duration(&self, failures: u32, prior_lockouts: u32) -> Option<Duration> {
        if failures < self.config.threshold {
            return None;
        }
        let step = (failures - self.config.threshold).saturating_add(prior_lockouts) as usize;
        let minutes = self
            .config
            .schedule_minutes
            .get(step)
            .or_else(|| self.config.schedule_minutes.last())
            .copied()?;
        Some(Duration::minutes(minutes))
    }

    /// Count a failed attempt and lock the identifier once the threshold is
    /// crossed.
    pub async fn record_failure(
        &self,
        identifier: &str,
        principal_id: Option<Uuid>,
        ip_address: Option<&str>,
    ) -> LockStatus {
        let now = self.clock.now();

        let record = match with_timeout(
            self.store_timeout,
            "increment_failures",
            self.store.increment_failures(identifier, principal_id, now),
        )
        .await
        {
            Ok(record) => record,
            Err(e) => return self.fail_open("record_failure", identifier, ip_address, e).await,
        };

        metrics::record_lockout_event("failure");
        let failures = record.failed_attempts.max(0) as u32;
        let prior_lockouts = record.prior_lockouts.max(0) as u32;

        let Some(duration) = self.lockout_duration(failures, prior_lockouts) else {
            tracing::debug!(identifier = %identifier, failures, "Recorded authentication failure");
            return match record.locked_until {
                Some(until) if until > now => LockStatus::locked_until(until),
                _ => LockStatus::unlocked(),
            };
        };

        let suspicious = failures.saturating_add(prior_lockouts) >= self.config.suspicious_after;
        let newly_suspicious = suspicious && !record.suspicious_activity;

        let locked = match with_timeout(
            self.store_timeout,
            "apply_lockout",
            self.store
                .apply_lockout(identifier, now + duration, suspicious, now),
        )
        .await
        {
            Ok(record) => record,
            Err(e) => return self.fail_open("apply_lockout", identifier, ip_address, e).await,
        };

        let Some(locked_until) = locked.locked_until else {
            return LockStatus::unlocked();
        };

        metrics::record_lockout_event("locked");
        tracing::warn!(
            identifier = %identifier,
            principal_id = ?principal_id,
            failures,
            prior_lockouts,
            locked_until = %locked_until,
            "Account locked after repeated failures"
        );

        let mut event = AuditEvent::new(AuditAction::AccountLockedOut, AuditSeverity::Warning, now)
            .ip(ip_address)
            .with("identifier", identifier)
            .with("failed_attempts", failures)
            .with("prior_lockouts", prior_lockouts)
            .with("locked_until", locked_until.to_rfc3339());
        if let Some(id) = principal_id {
            event = event.principal(id);
        }
        self.auditor.record(event).await;

        if newly_suspicious {
            metrics::record_lockout_event("suspicious");
            tracing::error!(
                identifier = %identifier,
                principal_id = ?principal_id,
                failures,
                "Suspicious authentication activity"
            );
            let mut event =
                AuditEvent::new(AuditAction::SuspiciousActivity, AuditSeverity::Critical, now)
                    .ip(ip_address)
                    .with("identifier", identifier)
                    .with("failed_attempts", failures)
                    .with("prior_lockouts", prior_lockouts);
            if let Some(id) = principal_id {
                event = event.principal(id);
            }
            self.auditor.record(event).await;
        }

        LockStatus::locked_until(locked_until)
    }

    /// Current lock state. An elapsed lockout is cleared on the way out.
    pub async fn is_locked(&self, identifier: &str) -> LockStatus {
        let now = self.clock.now();

        let record = match with_timeout(
            self.store_timeout,
            "get_security_record",
            self.store.get_security_record(identifier),
        )
        .await
        {
            Ok(record) => record,
            Err(e) => return self.fail_open("is_locked", identifier, None, e).await,
        };

        match record {
            Some(record) if record.is_locked_at(now) => match record.locked_until {
                Some(until) => LockStatus::locked_until(until),
                None => LockStatus::unlocked(),
            },
            Some(record) if record.lockout_elapsed_at(now) => {
                match with_timeout(
                    self.store_timeout,
                    "clear_elapsed_lockout",
                    self.store.clear_elapsed_lockout(identifier, now),
                )
                .await
                {
                    Ok(true) => {
                        metrics::record_lockout_event("expired");
                        tracing::info!(identifier = %identifier, "Lockout expired");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(identifier = %identifier, error = %e, "Failed to clear elapsed lockout");
                    }
                }
                LockStatus::unlocked()
            }
            _ => LockStatus::unlocked(),
        }
    }

    /// Reset after a fully successful authentication. Failures are logged.
    pub async fn clear(&self, identifier: &str) {
        let now = self.clock.now();
        match with_timeout(
            self.store_timeout,
            "clear_security_record",
            self.store.clear_security_record(identifier, now),
        )
        .await
        {
            Ok(()) => metrics::record_lockout_event("cleared"),
            Err(e) => {
                tracing::warn!(identifier = %identifier, error = %e, "Failed to clear failure counter");
            }
        }
    }

    /// Bulk-clear lockouts whose window has passed.
    pub async fn cleanup_expired_lockouts(&self) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let cleared = with_timeout(
            self.store_timeout,
            "clear_expired_lockouts",
            self.store.clear_expired_lockouts(now),
        )
        .await?;
        if cleared > 0 {
            tracing::info!(cleared, "Cleared expired lockouts");
        }
        Ok(cleared)
    }

    async fn fail_open(
        &self,
        operation: &str,
        identifier: &str,
        ip_address: Option<&str>,
        error: StoreError,
    ) -> LockStatus {
        metrics::record_lockout_event("fail_open");
        tracing::error!(
            operation,
            identifier = %identifier,
            error = %error,
            "Lockout store failure; treating account as unlocked"
        );
        let event = AuditEvent::new(
            AuditAction::LockoutCheckFailed,
            AuditSeverity::Warning,
            self.clock.now(),
        )
        .ip(ip_address)
        .with("identifier", identifier)
        .with("operation", operation)
        .with("error", error.to_string());
        self.auditor.record(event).await;
        LockStatus::unlocked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::audit::MemoryAuditSink;
    use crate::store::MemoryStore;
    use crate::utils::ManualClock;

    struct Fixture {
        guard: AccountSecurityGuard,
        store: Arc<MemoryStore>,
        sink: Arc<MemoryAuditSink>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemoryAuditSink::new());
        let clock = ManualClock::new(Utc::now());
        let guard = AccountSecurityGuard::new(
            store.clone(),
            Auditor::new(sink.clone(), std::time::Duration::from_secs(1)),
            Arc::new(clock.clone()),
            LockoutConfig::default(),
            std::time::Duration::from_secs(1),
        );
        Fixture {
            guard,
            store,
            sink,
            clock,
        }
    }

    #[test]
    fn test_schedule_is_progressive_and_clamped() {
        let f = fixture();
        assert_eq!(f.guard.lockout_duration(2, 0), None);
        assert_eq!(f.guard.lockout_duration(3, 0), Some(Duration::minutes(1)));
        assert_eq!(f.guard.lockout_duration(4, 0), Some(Duration::minutes(5)));
        assert_eq!(f.guard.lockout_duration(5, 0), Some(Duration::minutes(15)));
        assert_eq!(f.guard.lockout_duration(40, 0), Some(Duration::minutes(15)));

        assert_eq!(f.guard.lockout_duration(2, 4), None);
        assert_eq!(f.guard.lockout_duration(3, 1), Some(Duration::minutes(5)));
        assert_eq!(f.guard.lockout_duration(3, 2), Some(Duration::minutes(15)));
        assert_eq!(f.guard.lockout_duration(3, 9), Some(Duration::minutes(15)));
    }

    #[tokio::test]
    async fn test_third_failure_locks() {
        let f = fixture();
        let now = f.clock.now();

        assert!(!f.guard.record_failure("a@b.co", None, None).await.locked);
        assert!(!f.guard.record_failure("a@b.co", None, None).await.locked);
        let status = f.guard.record_failure("a@b.co", None, None).await;

        assert!(status.locked);
        assert_eq!(status.locked_until, Some(now + Duration::minutes(1)));
        assert_eq!(f.guard.is_locked("a@b.co").await, status);
        assert_eq!(f.sink.count(AuditAction::AccountLockedOut), 1);
    }

    #[tokio::test]
    async fn test_elapsed_lockout_clears_lazily() {
        let f = fixture();
        for _ in 0..3 {
            f.guard.record_failure("a@b.co", None, None).await;
        }

        f.clock.advance(Duration::minutes(1));
        assert_eq!(f.guard.is_locked("a@b.co").await, LockStatus::unlocked());

        let record = f.store.get_security_record("a@b.co").await.unwrap().unwrap();
        assert_eq!(record.failed_attempts, 0);
        assert_eq!(record.locked_until, None);
        assert_eq!(record.prior_lockouts, 1);
    }

    #[tokio::test]
    async fn test_lockouts_escalate_across_episodes() {
        let f = fixture();
        let mut observed = Vec::new();
        for _ in 0..3 {
            let start = f.clock.now();
            let mut status = LockStatus::unlocked();
            for _ in 0..3 {
                status = f.guard.record_failure("a@b.co", None, None).await;
            }
            observed.push(status.locked_until.map(|until| until - start));
            f.clock.advance(Duration::minutes(30));
            assert!(!f.guard.is_locked("a@b.co").await.locked);
        }

        assert_eq!(
            observed,
            vec![
                Some(Duration::minutes(1)),
                Some(Duration::minutes(5)),
                Some(Duration::minutes(15)),
            ]
        );
        assert_eq!(f.sink.count(AuditAction::SuspiciousActivity), 1);
    }

    #[tokio::test]
    async fn test_clear_forgets_prior_lockouts() {
        let f = fixture();
        for _ in 0..3 {
            f.guard.record_failure("a@b.co", None, None).await;
        }
        f.clock.advance(Duration::minutes(2));
        f.guard.is_locked("a@b.co").await;
        f.guard.clear("a@b.co").await;

        let start = f.clock.now();
        let mut status = LockStatus::unlocked();
        for _ in 0..3 {
            status = f.guard.record_failure("a@b.co", None, None).await;
        }
        assert_eq!(status.locked_until, Some(start + Duration::minutes(1)));
    }

    #[tokio::test]
    async fn test_fifth_failure_flags_suspicious_once() {
        let f = fixture();
        for _ in 0..6 {
            f.guard.record_failure("a@b.co", None, None).await;
        }

        let record = f.store.get_security_record("a@b.co").await.unwrap().unwrap();
        assert!(record.suspicious_activity);
        assert_eq!(f.sink.count(AuditAction::SuspiciousActivity), 1);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open_and_is_audited() {
        let f = fixture();
        f.store.set_unavailable(true);

        assert_eq!(
            f.guard.record_failure("a@b.co", None, Some("10.0.0.1")).await,
            LockStatus::unlocked()
        );
        assert_eq!(f.guard.is_locked("a@b.co").await, LockStatus::unlocked());
        assert_eq!(f.sink.count(AuditAction::LockoutCheckFailed), 2);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let f = fixture();
        for identifier in ["a@b.co", "c@d.co"] {
            for _ in 0..3 {
                f.guard.record_failure(identifier, None, None).await;
            }
        }

        f.clock.advance(Duration::minutes(2));
        assert_eq!(f.guard.cleanup_expired_lockouts().await.unwrap(), 2);
        assert_eq!(f.guard.cleanup_expired_lockouts().await.unwrap(), 0);
    }
}
