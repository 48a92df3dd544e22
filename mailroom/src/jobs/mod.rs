//! Background delivery jobs
//!
//! Ingress enqueues an [`EmailJob`] on a [`JobBroker`]. A [`WorkerPool`]
//! dequeues jobs and runs each through the [`DeliveryPipeline`], which
//! renders, sends and records the outcome, then tells the broker whether to
//! acknowledge, retry with backoff, or dead-letter the job.
//!
//! # Example
//!
//! ```rust,no_run
//! use mailroom::jobs::{InMemoryBroker, JobBroker, WorkerPool};
//! # use mailroom::jobs::DeliveryPipeline;
//! # use std::sync::Arc;
//!
//! # async fn example(pipeline: Arc<DeliveryPipeline>) {
//! let broker = Arc::new(InMemoryBroker::default());
//! let pool = WorkerPool::spawn(broker, pipeline, &Default::default());
//!
//! // ... on SIGTERM:
//! pool.shutdown(std::time::Duration::from_secs(30)).await;
//! # }
//! ```

mod backoff;
mod broker;
mod cancellation;
mod error;
mod job;
mod pipeline;
mod worker;

pub use backoff::Backoff;
pub use broker::{
    DeadLetter, Delivery, InMemoryBroker, JobBroker, QueueDepths, DEFAULT_MAX_ATTEMPTS,
};
#[cfg(feature = "redis")]
pub use broker::RedisBroker;
pub use cancellation::{CancellationToken, ShutdownResult};
pub use error::{JobError, JobResult};
pub use job::{EmailJob, JobId, DEFAULT_SUBJECT};
pub use pipeline::{DeliveryPipeline, JobOutcome};
pub use worker::{WorkerPool, WorkerStats};
