//! In-process job broker
//!
//! Delays run on the tokio clock so paused-time tests can step through
//! backoff schedules.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{DeadLetter, Delivery, Envelope, JobBroker, QueueDepths, DEFAULT_MAX_ATTEMPTS};
use crate::jobs::{Backoff, EmailJob, JobError, JobId, JobResult};

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<Envelope>,
    delayed: Vec<(Instant, Envelope)>,
    in_flight: HashMap<JobId, Envelope>,
    dead: Vec<DeadLetter>,
    closed: bool,
}

impl State {
    fn promote_due(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.delayed.len() {
            if self.delayed[index].0 <= now {
                let (_, envelope) = self.delayed.swap_remove(index);
                self.pending.push_back(envelope);
            } else {
                index += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }

    fn take_in_flight(&mut self, delivery: &Delivery) -> JobResult<Envelope> {
        self.in_flight
            .remove(&delivery.id)
            .ok_or_else(|| JobError::NotInFlight(delivery.id.to_string()))
    }
}

/// [`JobBroker`] held in process memory
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    ready: Notify,
    backoff: Backoff,
    max_attempts: u32,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(Backoff::default(), DEFAULT_MAX_ATTEMPTS)
    }
}

impl InMemoryBroker {
    /// Create a broker with the given retry policy
    #[must_use]
    pub fn new(backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ready: Notify::new(),
            backoff,
            max_attempts,
        }
    }

    /// Dead-lettered jobs, oldest first
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead.clone()
    }

    /// Stop handing out jobs; waiting and future dequeues return `Closed`
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_waiters();
    }
}

#[async_trait]
impl JobBroker for InMemoryBroker {
    async fn enqueue(&self, job: EmailJob) -> JobResult<JobId> {
        let envelope = Envelope::new(job, self.max_attempts);
        let id = envelope.id;
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(JobError::Closed);
            }
            state.pending.push_back(envelope);
        }
        self.ready.notify_one();
        debug!(job_id = %id, "Job enqueued");
        Ok(id)
    }

    async fn dequeue(&self, wait: Duration) -> JobResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.ready.notified();
            let wake_at = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(JobError::Closed);
                }

                let now = Instant::now();
                state.promote_due(now);
                if let Some(envelope) = state.pending.pop_front() {
                    state.in_flight.insert(envelope.id, envelope.clone());
                    let receipt = envelope.id.to_string();
                    return Ok(Some(Delivery::from_envelope(envelope, receipt)));
                }

                if now >= deadline {
                    return Ok(None);
                }
                state.next_due().map_or(deadline, |due| due.min(deadline))
            };

            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> JobResult<()> {
        self.state.lock().take_in_flight(delivery)?;
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, error: &str) -> JobResult<Duration> {
        let delay = self.backoff.delay(delivery.attempt);
        {
            let mut state = self.state.lock();
            let envelope = state.take_in_flight(delivery)?;
            state
                .delayed
                .push((Instant::now() + delay, envelope.next_attempt(error)));
        }
        self.ready.notify_one();
        Ok(delay)
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str) -> JobResult<()> {
        let mut state = self.state.lock();
        let envelope = state.take_in_flight(delivery)?;
        warn!(job_id = %envelope.id, attempts = envelope.attempt, error, "Job dead-lettered");
        state.dead.push(DeadLetter {
            id: envelope.id,
            job: envelope.job,
            attempts: envelope.attempt,
            error: error.to_string(),
            dead_at: Utc::now(),
        });
        Ok(())
    }

    async fn depths(&self) -> JobResult<QueueDepths> {
        let state = self.state.lock();
        Ok(QueueDepths {
            pending: state.pending.len(),
            delayed: state.delayed.len(),
            in_flight: state.in_flight.len(),
            dead: state.dead.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::broker::tests::job;
    use std::sync::Arc;

    fn broker() -> InMemoryBroker {
        InMemoryBroker::new(
            Backoff::new(Duration::from_secs(1), Duration::from_secs(60)).with_jitter(0.0),
            3,
        )
    }

    #[tokio::test]
    async fn test_fifo_and_ack() {
        let broker = broker();
        let first = broker.enqueue(job("a@example.com")).await.unwrap();
        broker.enqueue(job("b@example.com")).await.unwrap();

        let delivery = broker.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(delivery.id, first);
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.max_attempts, 3);

        broker.ack(&delivery).await.unwrap();
        assert!(matches!(broker.ack(&delivery).await, Err(JobError::NotInFlight(_))));
        assert_eq!(broker.depths().await.unwrap().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_dequeue_waits_then_gives_up() {
        let broker = broker();
        let started = Instant::now();
        assert!(broker.dequeue(Duration::from_millis(500)).await.unwrap().is_none());
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_redelivers_after_backoff() {
        let broker = broker();
        broker.enqueue(job("a@example.com")).await.unwrap();

        let first = broker.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(broker.retry(&first, "SMTP timeout").await.unwrap(), Duration::from_secs(1));
        assert!(broker.dequeue(Duration::ZERO).await.unwrap().is_none());

        let started = Instant::now();
        let second = broker.dequeue(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.last_error.as_deref(), Some("SMTP timeout"));

        assert_eq!(broker.retry(&second, "SMTP timeout").await.unwrap(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_dead_letter_parks_job() {
        let broker = broker();
        broker.enqueue(job("a@example.com")).await.unwrap();
        let delivery = broker.dequeue(Duration::ZERO).await.unwrap().unwrap();

        broker.dead_letter(&delivery, "template not found: nope").await.unwrap();
        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error, "template not found: nope");
        assert_eq!(broker.depths().await.unwrap(), QueueDepths { dead: 1, ..QueueDepths::default() });
    }

    #[tokio::test]
    async fn test_waiting_consumer_wakes_on_enqueue() {
        let broker = Arc::new(broker());
        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.dequeue(Duration::from_secs(10)).await })
        };

        tokio::task::yield_now().await;
        broker.enqueue(job("a@example.com")).await.unwrap();
        assert!(consumer.await.unwrap().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_close_rejects_work() {
        let broker = broker();
        broker.close();
        assert!(matches!(broker.enqueue(job("a@example.com")).await, Err(JobError::Closed)));
        assert!(matches!(broker.dequeue(Duration::ZERO).await, Err(JobError::Closed)));
    }
}
