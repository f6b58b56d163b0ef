use thiserror::Error;

/// Infrastructure errors raised while bootstrapping or running a service.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Telemetry error: {0}")]
    TelemetryError(anyhow::Error),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl AppError {
    /// Whether the failure is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::ServiceUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(AppError::ServiceUnavailable.is_retryable());
        assert!(!AppError::ConfigError(anyhow::anyhow!("bad")).is_retryable());
        assert!(!AppError::InternalError(anyhow::anyhow!("boom")).is_retryable());
    }

    #[test]
    fn test_io_error_maps_to_internal() {
        let err: AppError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(matches!(err, AppError::InternalError(_)));
    }
}
