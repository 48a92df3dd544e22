//! Worker pool
//!
//! N tasks share one broker, one pipeline and one rate limiter. Each task
//! takes a job, waits for a rate-limit slot, runs it to an outcome and
//! settles it with the broker before taking the next. Cancellation stops
//! workers from taking new jobs; a job already taken always runs to its
//! outcome.

use futures_util::future::join_all;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    CancellationToken, Delivery, DeliveryPipeline, JobBroker, JobError, JobOutcome, ShutdownResult,
};
use crate::config::WorkerSettings;

/// Counters across every worker in a pool
#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    skipped: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time job counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Jobs a provider accepted
    pub sent: u64,
    /// Redelivered jobs that found their message already handled
    pub skipped: u64,
    /// Attempts scheduled for retry
    pub retried: u64,
    /// Jobs that failed permanently
    pub failed: u64,
}

impl WorkerStats {
    /// Jobs that reached a final outcome
    #[must_use]
    pub const fn settled(&self) -> u64 {
        self.sent + self.skipped + self.failed
    }
}

/// Running set of delivery workers
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    token: CancellationToken,
    counters: Arc<Counters>,
}

struct Worker {
    index: usize,
    broker: Arc<dyn JobBroker>,
    pipeline: Arc<DeliveryPipeline>,
    limiter: Arc<DefaultDirectRateLimiter>,
    counters: Arc<Counters>,
    token: CancellationToken,
    poll_timeout: Duration,
}

impl WorkerPool {
    /// Start `settings.concurrency` workers
    #[must_use]
    pub fn spawn(
        broker: Arc<dyn JobBroker>,
        pipeline: Arc<DeliveryPipeline>,
        settings: &WorkerSettings,
    ) -> Self {
        let rate = NonZeroU32::new(settings.rate_limit_per_second).unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(rate)));
        let token = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let concurrency = settings.concurrency.max(1);

        let workers = (0..concurrency)
            .map(|index| {
                let worker = Worker {
                    index,
                    broker: broker.clone(),
                    pipeline: pipeline.clone(),
                    limiter: limiter.clone(),
                    counters: counters.clone(),
                    token: token.clone(),
                    poll_timeout: settings.poll_timeout(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            concurrency,
            rate_limit_per_second = rate.get(),
            "Worker pool started"
        );

        Self {
            workers,
            token,
            counters,
        }
    }

    /// Token that stops the pool when cancelled
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Current job counts
    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop taking jobs and wait up to `grace` for in-flight jobs
    ///
    /// Workers still running at the deadline are aborted; their jobs stay in
    /// flight on the broker and are redelivered later.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownResult {
        info!(grace_secs = grace.as_secs(), "Shutting down worker pool");
        self.token.cancel();

        if tokio::time::timeout(grace, join_all(self.workers.iter_mut())).await.is_ok() {
            info!(stats = ?self.stats(), "Worker pool stopped gracefully");
            return ShutdownResult::Graceful;
        }

        let workers_remaining = self.workers.iter().filter(|w| !w.is_finished()).count();
        for worker in &self.workers {
            worker.abort();
        }
        warn!(workers_remaining, "Worker pool forced shutdown after grace period");
        ShutdownResult::Forced { workers_remaining }
    }
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.index, "Worker started");

        while !self.token.is_cancelled() {
            let next = self
                .token
                .run_until_cancelled(self.broker.dequeue(self.poll_timeout))
                .await;

            let delivery = match next {
                None | Some(Err(JobError::Closed)) => break,
                Some(Ok(None)) => continue,
                Some(Ok(Some(delivery))) => delivery,
                Some(Err(e)) => {
                    error!(worker = self.index, error = %e, "Dequeue failed");
                    let _ = self
                        .token
                        .run_until_cancelled(tokio::time::sleep(self.poll_timeout))
                        .await;
                    continue;
                }
            };

            self.limiter.until_ready().await;
            let outcome = self.pipeline.handle(&delivery).await;
            self.settle(&delivery, outcome).await;
        }

        debug!(worker = self.index, "Worker stopped");
    }

    async fn settle(&self, delivery: &Delivery, outcome: JobOutcome) {
        let result = match &outcome {
            JobOutcome::Sent(_) | JobOutcome::SentUnrecorded { .. } => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                self.broker.ack(delivery).await
            }
            JobOutcome::Skipped { .. } => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                self.broker.ack(delivery).await
            }
            JobOutcome::Retry { error } => {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                self.broker.retry(delivery, error).await.map(|delay| {
                    debug!(job_id = %delivery.id, delay_ms = delay.as_millis(), "Retry scheduled");
                })
            }
            JobOutcome::Failed { error } => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.broker.dead_letter(delivery, error).await
            }
        };

        if let Err(e) = result {
            error!(job_id = %delivery.id, outcome = ?outcome, error = %e, "Could not settle job");
        }
    }
}
