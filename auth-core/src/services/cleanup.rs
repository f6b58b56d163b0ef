//! Periodic purge of expired token, blacklist and lockout state.
//!
//! Every step is a conditional bulk update, so overlapping runs (or a run
//! racing live traffic) only re-apply work that is already done.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::models::{AuditAction, AuditEvent, AuditSeverity};
use crate::services::account_guard::AccountSecurityGuard;
use crate::services::audit::Auditor;
use crate::store::{with_timeout, TokenStore};
use crate::utils::Clock;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_tokens: u64,
    pub purged_blacklist_entries: u64,
    pub cleared_lockouts: u64,
    /// Steps that failed this run; they are retried on the next tick.
    pub failed_steps: Vec<&'static str>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

#[derive(Clone)]
pub struct CleanupSweeper {
    store: Arc<dyn TokenStore>,
    guard: AccountSecurityGuard,
    auditor: Auditor,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl CleanupSweeper {
    pub fn new(
        store: Arc<dyn TokenStore>,
        guard: AccountSecurityGuard,
        auditor: Auditor,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            guard,
            auditor,
            clock,
            store_timeout,
        }
    }

    /// One pass over all three steps. A failing step does not stop the others.
    pub async fn run_once(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        match with_timeout(
            self.store_timeout,
            "expire_refresh_tokens",
            self.store.expire_refresh_tokens(now),
        )
        .await
        {
            Ok(count) => report.expired_tokens = count,
            Err(e) => {
                tracing::error!(step = "expire_refresh_tokens", error = %e, "Cleanup step failed");
                report.failed_steps.push("expire_refresh_tokens");
            }
        }

        match with_timeout(
            self.store_timeout,
            "purge_blacklist",
            self.store.purge_blacklist(now),
        )
        .await
        {
            Ok(count) => report.purged_blacklist_entries = count,
            Err(e) => {
                tracing::error!(step = "purge_blacklist", error = %e, "Cleanup step failed");
                report.failed_steps.push("purge_blacklist");
            }
        }

        match self.guard.cleanup_expired_lockouts().await {
            Ok(count) => report.cleared_lockouts = count,
            Err(e) => {
                tracing::error!(step = "clear_expired_lockouts", error = %e, "Cleanup step failed");
                report.failed_steps.push("clear_expired_lockouts");
            }
        }

        tracing::info!(
            expired_tokens = report.expired_tokens,
            purged_blacklist_entries = report.purged_blacklist_entries,
            cleared_lockouts = report.cleared_lockouts,
            failed_steps = ?report.failed_steps,
            "Cleanup sweep finished"
        );

        let severity = if report.is_clean() {
            AuditSeverity::Info
        } else {
            AuditSeverity::Warning
        };
        self.auditor
            .record(
                AuditEvent::new(AuditAction::CleanupCompleted, severity, now)
                    .with("expired_tokens", report.expired_tokens)
                    .with("purged_blacklist_entries", report.purged_blacklist_entries)
                    .with("cleared_lockouts", report.cleared_lockouts)
                    .with("failed_steps", report.failed_steps.clone()),
            )
            .await;

        report
    }

    /// Sweep every `interval` until `shutdown` is cancelled. The first sweep
    /// runs immediately.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval_secs = interval.as_secs(), "Cleanup sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Cleanup sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockoutConfig;
    use crate::models::{
        BlacklistEntry, NewRefreshToken, RefreshTokenRecord, RevocationReason, Session, TokenType,
    };
    use crate::services::audit::MemoryAuditSink;
    use crate::store::MemoryStore;
    use crate::utils::ManualClock;
    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    struct Fixture {
        sweeper: CleanupSweeper,
        guard: AccountSecurityGuard,
        store: Arc<MemoryStore>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc::now());
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let auditor = Auditor::new(Arc::new(MemoryAuditSink::new()), Duration::from_secs(1));
        let guard = AccountSecurityGuard::new(
            store.clone(),
            auditor.clone(),
            shared_clock.clone(),
            LockoutConfig::default(),
            Duration::from_secs(1),
        );
        let sweeper = CleanupSweeper::new(
            store.clone(),
            guard.clone(),
            auditor,
            shared_clock,
            Duration::from_secs(1),
        );
        Fixture {
            sweeper,
            guard,
            store,
            clock,
        }
    }

    async fn seed_session(store: &MemoryStore, now: chrono::DateTime<Utc>) -> Uuid {
        let principal_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let token = RefreshTokenRecord::issue(NewRefreshToken {
            id: Uuid::new_v4(),
            principal_id,
            session_id,
            token: "refresh",
            device_fingerprint: "fp".to_string(),
            ip_address: None,
            remember_me: false,
            issued_at: now,
            expires_at: now + ChronoDuration::days(7),
            rotation_count: 0,
        });
        let session = Session {
            id: session_id,
            principal_id,
            current_refresh_token_id: token.id,
            device_fingerprint: "fp".to_string(),
            ip_address: None,
            user_agent: None,
            created_at: now,
            last_activity_at: now,
            is_active: true,
            ended_at: None,
            end_reason: None,
        };
        store.create_session(&session, &token).await.unwrap();
        session_id
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let f = fixture();
        let now = f.clock.now();
        let session_id = seed_session(&f.store, now).await;
        f.store
            .blacklist(&BlacklistEntry::new(
                "old-access".to_string(),
                Uuid::new_v4(),
                TokenType::Access,
                now + ChronoDuration::minutes(15),
                RevocationReason::Logout,
                now,
            ))
            .await
            .unwrap();
        for _ in 0..3 {
            f.guard.record_failure("x@y.co", None, None).await;
        }

        f.clock.advance(ChronoDuration::days(8));
        let first = f.sweeper.run_once().await;
        assert_eq!(
            first,
            SweepReport {
                expired_tokens: 1,
                purged_blacklist_entries: 1,
                cleared_lockouts: 1,
                failed_steps: vec![],
            }
        );

        let second = f.sweeper.run_once().await;
        assert_eq!(second, SweepReport::default());

        let session = f.store.find_session(session_id).await.unwrap().unwrap();
        assert!(!session.is_active);
        assert_eq!(session.end_reason, Some(RevocationReason::Expired));
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_do_not_double_count() {
        let f = fixture();
        let now = f.clock.now();
        for _ in 0..4 {
            seed_session(&f.store, now).await;
        }
        f.clock.advance(ChronoDuration::days(8));

        let (a, b) = tokio::join!(f.sweeper.run_once(), f.sweeper.run_once());
        assert_eq!(a.expired_tokens + b.expired_tokens, 4);
    }

    #[tokio::test]
    async fn test_failed_steps_are_reported() {
        let f = fixture();
        f.store.set_unavailable(true);

        let report = f.sweeper.run_once().await;
        assert_eq!(report.failed_steps.len(), 3);
        assert!(!report.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let f = fixture();
        let shutdown = CancellationToken::new();
        let sweeper = f.sweeper.clone();
        let token = shutdown.clone();

        let handle =
            tokio::spawn(async move { sweeper.run(Duration::from_secs(3600), token).await });
        tokio::time::sleep(Duration::from_secs(7200)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
