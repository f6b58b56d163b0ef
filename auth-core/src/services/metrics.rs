use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub static TOKEN_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static LOCKOUT_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Register the security counters. Until this runs, recording is a no-op.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let token_events = IntCounterVec::new(
        Opts::new("auth_token_events_total", "Token lifecycle events"),
        &["event"],
    )?;
    let lockout_events = IntCounterVec::new(
        Opts::new("auth_lockout_events_total", "Account lockout events"),
        &["event"],
    )?;

    registry.register(Box::new(token_events.clone()))?;
    registry.register(Box::new(lockout_events.clone()))?;

    // Initialize globals
    let _ = REGISTRY.set(registry);
    let _ = TOKEN_EVENTS_TOTAL.set(token_events);
    let _ = LOCKOUT_EVENTS_TOTAL.set(lockout_events);
    Ok(())
}

/// e.g. `issued`, `rotated`, `replay_detected`, `revoked`.
pub fn record_token_event(event: &str) {
    if let Some(counter) = TOKEN_EVENTS_TOTAL.get() {
        counter.with_label_values(&[event]).inc();
    }
}

/// e.g. `failure`, `locked`, `suspicious`, `cleared`, `fail_open`.
pub fn record_lockout_event(event: &str) {
    if let Some(counter) = LOCKOUT_EVENTS_TOTAL.get() {
        counter.with_label_values(&[event]).inc();
    }
}

pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to convert metrics to UTF-8: {}", e);
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}
