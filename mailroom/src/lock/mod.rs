//! Distributed mutual exclusion with expiry
//!
//! A lock is a key in a shared store holding a random token. Acquisition is an
//! atomic set-if-absent with a TTL; release deletes the key only while it
//! still holds the caller's token, so a holder whose lease expired can never
//! remove a lock that has since been taken by someone else.
//!
//! There is no lease renewal. The TTL must exceed the worst-case duration of
//! the protected operation.
//!
//! # Example
//!
//! ```rust
//! use std::{sync::Arc, time::Duration};
//! use mailroom::lock::{DistributedLock, InMemoryLockBackend, LockError};
//!
//! # async fn example() -> Result<(), LockError> {
//! let lock = DistributedLock::new(Arc::new(InMemoryLockBackend::new()));
//!
//! let answer = lock
//!     .with_lock("compile:welcome", Duration::from_secs(30), || async {
//!         Ok::<_, LockError>(42)
//!     })
//!     .await?;
//! assert_eq!(answer, 42);
//! # Ok(())
//! # }
//! ```

mod memory;
#[cfg(feature = "redis")]
mod redis_backend;

pub use memory::InMemoryLockBackend;
#[cfg(feature = "redis")]
pub use redis_backend::RedisLockBackend;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::LockSettings;

/// Namespace applied to every lock key
pub const KEY_PREFIX: &str = "lock:";

/// Errors raised by the lock service
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock stayed held by someone else for the whole wait window
    #[error("timed out after {waited:?} waiting for lock '{key}'")]
    Timeout {
        /// Namespaced lock key
        key: String,
        /// Time spent polling
        waited: Duration,
    },

    /// Redis command failed
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// No pooled Redis connection available
    #[cfg(feature = "redis")]
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Other backend failure
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Atomic primitives a lock store must provide
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Set `key` to `token` with expiry `ttl` only if `key` is absent
    ///
    /// Returns `true` when the key was set.
    ///
    /// # Errors
    ///
    /// Returns `LockError` if the store cannot be reached
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Delete `key` only if it currently holds `token`
    ///
    /// Returns `true` when the key was deleted.
    ///
    /// # Errors
    ///
    /// Returns `LockError` if the store cannot be reached
    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError>;
}

/// Proof of a successful acquisition
///
/// Holds the namespaced key and the holder token. Release it with
/// [`DistributedLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    token: String,
}

impl LockToken {
    /// Namespaced lock key (`lock:<resource>`)
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Holder token stored under the key
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Lock service polling a [`LockBackend`]
#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    poll_interval: Duration,
    max_wait: Duration,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("poll_interval", &self.poll_interval)
            .field("max_wait", &self.max_wait)
            .finish_non_exhaustive()
    }
}

impl DistributedLock {
    /// Create a lock service with the default 100ms poll and 5s wait
    #[must_use]
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self::with_settings(backend, &LockSettings::default())
    }

    /// Create a lock service from configuration
    #[must_use]
    pub fn with_settings(backend: Arc<dyn LockBackend>, settings: &LockSettings) -> Self {
        Self {
            backend,
            poll_interval: settings.poll_interval(),
            max_wait: settings.max_wait(),
        }
    }

    /// Acquire the lock for `resource`, polling until `max_wait` elapses
    ///
    /// # Errors
    ///
    /// Returns `LockError::Timeout` if the lock is still held after the wait
    /// window, or a backend error if the store fails.
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockToken, LockError> {
        let key = format!("{KEY_PREFIX}{resource}");
        let started = Instant::now();

        loop {
            // Each attempt gets its own token.
            let token = Uuid::new_v4().to_string();
            if self.backend.try_acquire(&key, &token, ttl).await? {
                debug!(key = %key, waited_ms = started.elapsed().as_millis(), "Lock acquired");
                return Ok(LockToken { key, token });
            }

            let waited = started.elapsed();
            if waited >= self.max_wait {
                warn!(key = %key, waited_ms = waited.as_millis(), "Timed out waiting for lock");
                return Err(LockError::Timeout { key, waited });
            }

            trace!(key = %key, "Lock busy, polling");
            tokio::time::sleep(self.poll_interval.min(self.max_wait - waited)).await;
        }
    }

    /// Release a lock previously returned by [`acquire`](Self::acquire)
    ///
    /// A token that no longer matches (the lease expired and someone else
    /// took the lock) is a no-op. Returns whether the key was deleted.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the store fails
    pub async fn release(&self, lock: &LockToken) -> Result<bool, LockError> {
        let released = self.backend.release(&lock.key, &lock.token).await?;
        if released {
            debug!(key = %lock.key, "Lock released");
        } else {
            debug!(key = %lock.key, "Lock no longer held by this token, release skipped");
        }
        Ok(released)
    }

    /// Run `task` while holding the lock for `resource`
    ///
    /// The lock is released after the task finishes, whether it returned
    /// `Ok` or `Err`. A failed release is logged and never replaces the
    /// task's result.
    ///
    /// # Errors
    ///
    /// Returns the acquisition error converted into `E`, or the task's error
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        resource: &str,
        ttl: Duration,
        task: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        E: From<LockError>,
    {
        let lock = self.acquire(resource, ttl).await?;
        let result = task().await;

        if let Err(e) = self.release(&lock).await {
            warn!(key = %lock.key, error = %e, "Failed to release lock; it will expire");
        }

        result
    }
}
