use auth_core::{
    config::AuthConfig,
    db,
    services::rbac::RedisPermissionCache,
    services::{metrics, AuthService, AuthSettings, PermissionCache, PgAuditSink},
    store::PgStore,
    utils::{CredentialVerifier, SystemClock},
};
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();

    // Load configuration - fail fast if invalid
    let config = AuthConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    )?;

    metrics::init_metrics().map_err(|e| AppError::TelemetryError(anyhow::anyhow!(e)))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting auth sweeper"
    );

    let pool = db::create_pool(&config.database)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
    db::run_migrations(&pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
    db::health_check(&pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
    tracing::info!("Database initialized successfully");

    let permission_cache: Option<Arc<dyn PermissionCache>> = match &config.redis.url {
        Some(url) => {
            let cache: Arc<dyn PermissionCache> = Arc::new(
                RedisPermissionCache::new(url, config.redis.permission_cache_ttl_seconds).await?,
            );
            tracing::info!("Redis permission cache initialized");
            Some(cache)
        }
        None => None,
    };

    let service = AuthService::new(
        Arc::new(PgStore::new(pool.clone())),
        AuthSettings::from_config(&config),
        CredentialVerifier::new()?,
        Arc::new(PgAuditSink::new(pool)),
        Arc::new(SystemClock),
        permission_cache,
    )?;

    let shutdown = CancellationToken::new();
    let sweeper = service.sweeper();
    let interval = Duration::from_secs(config.cleanup.interval_hours.max(1) * 3600);
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { sweeper.run(interval, token).await });

    shutdown_signal().await;
    shutdown.cancel();
    handle
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;

    tracing::info!("Auth sweeper shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
