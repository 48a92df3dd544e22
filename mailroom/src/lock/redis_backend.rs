//! Redis lock backend
//!
//! Acquisition is `SET key token NX PX ttl`. Release runs a Lua script so the
//! compare and the delete happen atomically on the server.

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::Script;
use std::time::Duration;

use super::{LockBackend, LockError};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// [`LockBackend`] backed by a Redis connection pool
#[derive(Clone)]
pub struct RedisLockBackend {
    pool: Pool,
    release: Script,
}

impl std::fmt::Debug for RedisLockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockBackend")
            .field("pool", &self.pool.status())
            .finish_non_exhaustive()
    }
}

impl RedisLockBackend {
    /// Create a backend sharing an existing pool
    #[must_use]
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            release: Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.pool.get().await?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.pool.get().await?;
        let deleted: i64 = self
            .release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Pool {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        deadpool_redis::Config::from_url(url)
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a running Redis (set REDIS_URL)"]
    async fn test_redis_compare_and_delete() {
        let backend = RedisLockBackend::new(pool());
        let key = format!("lock:test:{}", uuid::Uuid::new_v4());

        assert!(backend.try_acquire(&key, "owner", Duration::from_secs(5)).await.unwrap());
        assert!(!backend.try_acquire(&key, "intruder", Duration::from_secs(5)).await.unwrap());
        assert!(!backend.release(&key, "intruder").await.unwrap());
        assert!(backend.release(&key, "owner").await.unwrap());
        assert!(backend.try_acquire(&key, "intruder", Duration::from_secs(5)).await.unwrap());
        assert!(backend.release(&key, "intruder").await.unwrap());
    }
}
