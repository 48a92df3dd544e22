//! Job-related error types.

use thiserror::Error;

/// Result type for broker operations.
pub type JobResult<T> = Result<T, JobError>;

/// Errors that can occur while moving jobs through a broker.
#[derive(Debug, Error)]
pub enum JobError {
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// No pooled Redis connection available.
    #[cfg(feature = "redis")]
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// The delivery is not in flight (already acked, retried or dead-lettered).
    #[error("job not in flight: {0}")]
    NotInFlight(String),

    /// The broker has been closed.
    #[error("job broker is closed")]
    Closed,
}

impl JobError {
    /// Whether a later attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        #[cfg(feature = "redis")]
        if matches!(self, Self::Redis(_) | Self::Pool(_)) {
            return true;
        }
        false
    }
}
