//! Redis job broker
//!
//! Keys under the configured prefix:
//! - `<prefix>:pending` list of ready envelopes (LPUSH in, popped from the right)
//! - `<prefix>:processing` list of envelopes handed to a worker
//! - `<prefix>:delayed` sorted set of retries scored by due time (epoch ms)
//! - `<prefix>:dead` list of dead letters, newest first
//!
//! Dequeue moves an envelope from `pending` to `processing` in one command, so
//! a worker crash leaves the job in `processing` where
//! [`RedisBroker::recover_in_flight`] can find it.

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::Pool;
use redis::Script;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{DeadLetter, Delivery, Envelope, JobBroker, QueueDepths, DEFAULT_MAX_ATTEMPTS};
use crate::jobs::{Backoff, EmailJob, JobId, JobResult};

/// Moves due retries from the delayed set onto the consuming end of pending.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, ARGV[2])
for _, member in ipairs(due) do
    redis.call("ZREM", KEYS[1], member)
    redis.call("RPUSH", KEYS[2], member)
end
return #due
"#;

const PROMOTE_BATCH: usize = 100;

/// [`JobBroker`] backed by Redis lists and a sorted set
#[derive(Clone)]
pub struct RedisBroker {
    pool: Pool,
    promote: Script,
    backoff: Backoff,
    max_attempts: u32,
    pending: String,
    processing: String,
    delayed: String,
    dead: String,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("pending", &self.pending)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Create a broker using keys under `prefix`
    #[must_use]
    pub fn new(pool: Pool, prefix: &str, backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            pool,
            promote: Script::new(PROMOTE_SCRIPT),
            backoff,
            max_attempts,
            pending: format!("{prefix}:pending"),
            processing: format!("{prefix}:processing"),
            delayed: format!("{prefix}:delayed"),
            dead: format!("{prefix}:dead"),
        }
    }

    /// Broker with the default retry policy
    #[must_use]
    pub fn with_defaults(pool: Pool, prefix: &str) -> Self {
        Self::new(pool, prefix, Backoff::default(), DEFAULT_MAX_ATTEMPTS)
    }

    /// Move every in-flight envelope back to pending
    ///
    /// Only safe when no other worker process is consuming the same keys.
    ///
    /// # Errors
    ///
    /// Returns `JobError` if Redis cannot be reached
    pub async fn recover_in_flight(&self) -> JobResult<usize> {
        let mut conn = self.pool.get().await?;
        let mut moved = 0;
        loop {
            let envelope: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing)
                .arg(&self.pending)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if envelope.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            info!(count = moved, "Recovered in-flight jobs");
        }
        Ok(moved)
    }

    /// Most recent dead letters, newest first
    ///
    /// # Errors
    ///
    /// Returns `JobError` if Redis cannot be reached or an entry is malformed
    pub async fn dead_letters(&self, limit: usize) -> JobResult<Vec<DeadLetter>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await?;
        let stop = i64::try_from(limit).unwrap_or(i64::MAX) - 1;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.dead)
            .arg(0)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(Into::into))
            .collect()
    }

    async fn promote_due(&self, conn: &mut deadpool_redis::Connection) -> JobResult<()> {
        let promoted: usize = self
            .promote
            .key(&self.delayed)
            .key(&self.pending)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(conn)
            .await?;
        if promoted > 0 {
            debug!(count = promoted, "Promoted delayed jobs");
        }
        Ok(())
    }
}

#[async_trait]
impl JobBroker for RedisBroker {
    async fn enqueue(&self, job: EmailJob) -> JobResult<JobId> {
        let envelope = Envelope::new(job, self.max_attempts);
        let raw = serde_json::to_string(&envelope)?;

        let mut conn = self.pool.get().await?;
        let _: usize = redis::cmd("LPUSH")
            .arg(&self.pending)
            .arg(raw)
            .query_async(&mut conn)
            .await?;

        debug!(job_id = %envelope.id, "Job enqueued");
        Ok(envelope.id)
    }

    async fn dequeue(&self, wait: Duration) -> JobResult<Option<Delivery>> {
        let mut conn = self.pool.get().await?;
        self.promote_due(&mut conn).await?;

        // BLMOVE treats a zero timeout as "block forever".
        let raw: Option<String> = if wait.is_zero() {
            redis::cmd("LMOVE")
                .arg(&self.pending)
                .arg(&self.processing)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?
        } else {
            redis::cmd("BLMOVE")
                .arg(&self.pending)
                .arg(&self.processing)
                .arg("RIGHT")
                .arg("LEFT")
                .arg(wait.as_secs_f64())
                .query_async(&mut conn)
                .await?
        };

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<Envelope>(&raw) {
            Ok(envelope) => Ok(Some(Delivery::from_envelope(envelope, raw))),
            Err(e) => {
                warn!(error = %e, "Dropping undecodable job envelope");
                let _: () = redis::pipe()
                    .atomic()
                    .cmd("LREM")
                    .arg(&self.processing)
                    .arg(1)
                    .arg(&raw)
                    .ignore()
                    .cmd("LPUSH")
                    .arg(&self.dead)
                    .arg(&raw)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                Err(e.into())
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> JobResult<()> {
        let mut conn = self.pool.get().await?;
        let removed: usize = redis::cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(&delivery.receipt)
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            warn!(job_id = %delivery.id, "Acked job was not in flight");
        }
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, error: &str) -> JobResult<Duration> {
        let envelope: Envelope = serde_json::from_str(&delivery.receipt)?;
        let next = serde_json::to_string(&envelope.next_attempt(error))?;

        let delay = self.backoff.delay(delivery.attempt);
        let due_ms = Utc::now().timestamp_millis()
            + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);

        let mut conn = self.pool.get().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(&delivery.receipt)
            .ignore()
            .cmd("ZADD")
            .arg(&self.delayed)
            .arg(due_ms)
            .arg(next)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(delay)
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> JobResult<()> {
        let dead = serde_json::to_string(&DeadLetter {
            id: delivery.id,
            job: delivery.job.clone(),
            attempts: delivery.attempt,
            error: error.to_string(),
            dead_at: Utc::now(),
        })?;

        let mut conn = self.pool.get().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(&delivery.receipt)
            .ignore()
            .cmd("LPUSH")
            .arg(&self.dead)
            .arg(dead)
            .ignore()
            .query_async(&mut conn)
            .await?;

        warn!(job_id = %delivery.id, attempts = delivery.attempt, error, "Job dead-lettered");
        Ok(())
    }

    async fn depths(&self) -> JobResult<QueueDepths> {
        let mut conn = self.pool.get().await?;
        let (pending, delayed, in_flight, dead): (usize, usize, usize, usize) = redis::pipe()
            .cmd("LLEN")
            .arg(&self.pending)
            .cmd("ZCARD")
            .arg(&self.delayed)
            .cmd("LLEN")
            .arg(&self.processing)
            .cmd("LLEN")
            .arg(&self.dead)
            .query_async(&mut conn)
            .await?;

        Ok(QueueDepths {
            pending,
            delayed,
            in_flight,
            dead,
        })
    }
}
