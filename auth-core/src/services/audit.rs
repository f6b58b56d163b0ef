//! Audit trail for security-relevant actions.
//!
//! Audit events are separate from logs: they go to an [`AuditSink`]. The
//! [`Auditor`] bounds every write and never surfaces a sink failure to the
//! caller; failures are logged instead.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::models::{AuditAction, AuditEvent, AuditSeverity};

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<(), anyhow::Error>;
}

/// Writes audit events as structured log lines.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), anyhow::Error> {
        tracing::info!(
            target: "audit",
            audit_id = %event.id,
            action = event.action.as_str(),
            severity = event.severity.as_str(),
            principal_id = ?event.principal_id,
            ip_address = ?event.ip_address,
            metadata = %event.metadata,
            "Audit event"
        );
        Ok(())
    }
}

/// Persists audit events to the `audit_events` table.
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (id, action, principal_id, ip_address, metadata, severity, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.action.as_str())
        .bind(event.principal_id)
        .bind(&event.ip_address)
        .bind(&event.metadata)
        .bind(event.severity.as_str())
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to write audit event: {}", e))?;
        Ok(())
    }
}

/// Keeps events in memory. Can be told to fail, to exercise the
/// failure path.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
    failing: AtomicBool,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.events().iter().map(|e| e.action).collect()
    }

    pub fn count(&self, action: AuditAction) -> usize {
        self.events().iter().filter(|e| e.action == action).count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent) -> Result<(), anyhow::Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("audit sink unavailable"));
        }
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("audit sink lock poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

/// Fire-and-forget front for an [`AuditSink`].
#[derive(Clone)]
pub struct Auditor {
    sink: Arc<dyn AuditSink>,
    timeout: Duration,
}

impl Auditor {
    pub fn new(sink: Arc<dyn AuditSink>, timeout: Duration) -> Self {
        Self { sink, timeout }
    }

    /// Record an event. Sink failures and timeouts are logged with the full
    /// event so that nothing security-relevant is silently lost.
    pub async fn record(&self, event: AuditEvent) {
        let outcome = tokio::time::timeout(self.timeout, self.sink.record(&event)).await;

        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", self.timeout.as_millis()),
        };

        match event.severity {
            AuditSeverity::Info => tracing::warn!(
                error = %failure,
                action = event.action.as_str(),
                principal_id = ?event.principal_id,
                metadata = %event.metadata,
                "Failed to write audit event"
            ),
            AuditSeverity::Warning | AuditSeverity::Critical => tracing::error!(
                error = %failure,
                action = event.action.as_str(),
                severity = event.severity.as_str(),
                principal_id = ?event.principal_id,
                ip_address = ?event.ip_address,
                metadata = %event.metadata,
                "Failed to write security audit event"
            ),
        }
    }
}
