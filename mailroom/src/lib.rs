//! mailroom: asynchronous transactional email delivery
//!
//! A send request is recorded as a `queued` message and handed to a job
//! queue. Workers render the named template, send it through a primary
//! provider with circuit-breaker failover to a secondary, and record every
//! step of the message lifecycle. Provider webhooks settle sent messages as
//! delivered, bounced or failed.
//!
//! Building blocks:
//!
//! - **lock**: lease-based distributed mutual exclusion over Redis
//! - **template**: compile-once artifact cache and timed rendering
//! - **email**: providers and the failover manager
//! - **lifecycle**: message records and their status state machine
//! - **jobs**: broker, retry backoff, delivery pipeline and worker pool
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mailroom::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = MailroomConfig::load()?;
//!     mailroom::observability::init(&config.logging)?;
//!
//!     let mailroom = Mailroom::connect(config).await?;
//!     let workers = mailroom.spawn_workers();
//!
//!     tokio::signal::ctrl_c().await?;
//!     workers.shutdown(std::time::Duration::from_secs(30)).await;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `postgres` - `PostgreSQL` message store (default)
//! - `redis` - Redis locks and job queue (default)
//! - `aws-ses` - Amazon SES v2 provider

#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod email;
pub mod error;
pub mod ingress;
pub mod jobs;
pub mod lifecycle;
pub mod lock;
pub mod observability;
pub mod state;
pub mod template;
pub mod testing;
pub mod webhook;

pub mod prelude {
    //! Convenience re-exports for common types and traits
    //!
    //! ```rust
    //! use mailroom::prelude::*;
    //! ```

    pub use crate::config::MailroomConfig;
    pub use crate::email::{EmailError, EmailProvider, FailoverManager, OutboundEmail, SendReceipt};
    pub use crate::error::DeliveryError;
    pub use crate::ingress::{Accepted, IngressError, MailService, SendMeta, SendRequest};
    pub use crate::jobs::{
        EmailJob, JobBroker, JobError, JobId, ShutdownResult, WorkerPool, WorkerStats,
    };
    pub use crate::lifecycle::{Message, MessageId, MessageStatus, MessageStore, StoreError};
    pub use crate::lock::{DistributedLock, LockError};
    pub use crate::state::Mailroom;
    pub use crate::template::{TemplateEngine, TemplateError};
    pub use crate::webhook::{DeliveryEvent, EventProcessor};

    pub use serde_json::json;
}
