//! Job brokers
//!
//! A broker hands out [`Delivery`] values one at a time and is told how each
//! one ended: [`JobBroker::ack`] on completion, [`JobBroker::retry`] to
//! schedule another attempt after a backoff delay, or
//! [`JobBroker::dead_letter`] to park it for inspection. Delivery is
//! at-least-once: a delivery that is never settled may be handed out again.

mod memory;
#[cfg(feature = "redis")]
mod redis_broker;

pub use memory::InMemoryBroker;
#[cfg(feature = "redis")]
pub use redis_broker::RedisBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{EmailJob, JobId, JobResult};

/// Default attempt budget per job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Broker-side record of a job, as stored on the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub id: JobId,
    pub job: EmailJob,
    pub attempt: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Envelope {
    pub(crate) fn new(job: EmailJob, max_attempts: u32) -> Self {
        Self {
            id: JobId::new(),
            job,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }

    pub(crate) fn next_attempt(&self, error: &str) -> Self {
        Self {
            attempt: self.attempt + 1,
            last_error: Some(error.to_string()),
            ..self.clone()
        }
    }
}

/// One attempt at a job, handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Job ID, stable across attempts.
    pub id: JobId,
    /// Payload.
    pub job: EmailJob,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Error from the previous attempt, if any.
    pub last_error: Option<String>,
    /// Broker-specific handle used to settle this delivery.
    pub(crate) receipt: String,
}

impl Delivery {
    pub(crate) fn from_envelope(envelope: Envelope, receipt: String) -> Self {
        Self {
            id: envelope.id,
            job: envelope.job,
            attempt: envelope.attempt,
            max_attempts: envelope.max_attempts,
            last_error: envelope.last_error,
            receipt,
        }
    }

    /// Whether a failure now exhausts the attempt budget.
    #[must_use]
    pub const fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A job that ran out of attempts or failed permanently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Job ID.
    pub id: JobId,
    /// Payload.
    pub job: EmailJob,
    /// Attempts made.
    pub attempts: u32,
    /// Final error.
    pub error: String,
    /// When it was parked.
    pub dead_at: DateTime<Utc>,
}

/// Queue sizes, for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    /// Ready to be dequeued.
    pub pending: usize,
    /// Waiting out a retry delay.
    pub delayed: usize,
    /// Handed to a worker and not yet settled.
    pub in_flight: usize,
    /// Dead-lettered.
    pub dead: usize,
}

/// A queue of email jobs with retry scheduling.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Add a job; its first delivery is attempt 1.
    ///
    /// # Errors
    ///
    /// Returns `JobError` if the job cannot be stored.
    async fn enqueue(&self, job: EmailJob) -> JobResult<JobId>;

    /// Take the next ready job, waiting up to `wait` for one to appear.
    ///
    /// # Errors
    ///
    /// Returns `JobError` if the broker cannot be read.
    async fn dequeue(&self, wait: Duration) -> JobResult<Option<Delivery>>;

    /// Mark a delivery as done.
    ///
    /// # Errors
    ///
    /// Returns `JobError` if the broker cannot be updated.
    async fn ack(&self, delivery: &Delivery) -> JobResult<()>;

    /// Schedule the next attempt after the backoff delay for this attempt.
    ///
    /// # Errors
    ///
    /// Returns `JobError` if the broker cannot be updated.
    async fn retry(&self, delivery: &Delivery, error: &str) -> JobResult<Duration>;

    /// Park a delivery permanently.
    ///
    /// # Errors
    ///
    /// Returns `JobError` if the broker cannot be updated.
    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> JobResult<()>;

    /// Current queue sizes.
    ///
    /// # Errors
    ///
    /// Returns `JobError` if the broker cannot be read.
    async fn depths(&self) -> JobResult<QueueDepths>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::MessageId;

    pub(crate) fn job(to: &str) -> EmailJob {
        EmailJob {
            to: to.to_string(),
            template: "welcome".to_string(),
            props: serde_json::Map::new(),
            subject: None,
            message_id: MessageId::new(),
            client_id: "client-1".to_string(),
            trace_id: None,
        }
    }

    #[test]
    fn test_next_attempt_keeps_identity() {
        let first = Envelope::new(job("a@example.com"), 3);
        let second = first.next_attempt("SMTP timeout");

        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.last_error.as_deref(), Some("SMTP timeout"));

        let delivery = Delivery::from_envelope(second.next_attempt("again"), String::new());
        assert!(delivery.is_final_attempt());
    }

    #[test]
    fn test_zero_budget_still_runs_once() {
        let envelope = Envelope::new(job("a@example.com"), 0);
        assert_eq!(envelope.max_attempts, 1);
    }
}
