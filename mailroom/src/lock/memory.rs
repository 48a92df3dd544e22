//! Process-local lock backend
//!
//! Useful for single-node deployments and tests. Expiry uses the tokio clock
//! so paused-time tests can advance through a TTL.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{LockBackend, LockError};

#[derive(Debug)]
struct Entry {
    token: String,
    expires_at: Instant,
}

/// In-memory [`LockBackend`]
#[derive(Debug, Default)]
pub struct InMemoryLockBackend {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryLockBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held by anyone
    #[must_use]
    pub fn is_held(&self, key: &str) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if entries.get(key).is_some_and(|entry| entry.expires_at > now) {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.token == token && entry.expires_at > Instant::now() => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_can_be_taken() {
        let backend = InMemoryLockBackend::new();
        assert!(backend.try_acquire("lock:a", "t1", Duration::from_secs(1)).await.unwrap());
        assert!(!backend.try_acquire("lock:a", "t2", Duration::from_secs(1)).await.unwrap());

        tokio::time::advance(Duration::from_millis(1001)).await;

        assert!(backend.try_acquire("lock:a", "t2", Duration::from_secs(1)).await.unwrap());
        // The first holder's lease is gone; its release must not touch t2's lock.
        assert!(!backend.release("lock:a", "t1").await.unwrap());
        assert!(backend.is_held("lock:a"));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let backend = InMemoryLockBackend::new();
        assert!(backend.try_acquire("lock:a", "t1", Duration::from_secs(5)).await.unwrap());
        assert!(backend.try_acquire("lock:b", "t1", Duration::from_secs(5)).await.unwrap());
    }
}
