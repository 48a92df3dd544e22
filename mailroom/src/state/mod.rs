//! Process-wide wiring
//!
//! Builds the shared components once from configuration: the message store,
//! the job broker, the template engine (with its distributed lock) and the
//! failover manager. Everything is handed out as `Arc`s so the ingress
//! facade, the worker pool and the webhook processor all see the same
//! circuit breaker and the same stores.

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use crate::config::MailroomConfig;
use crate::email::{provider_from_settings, FailoverManager};
use crate::ingress::MailService;
use crate::jobs::{Backoff, DeliveryPipeline, InMemoryBroker, JobBroker, WorkerPool};
use crate::lifecycle::{InMemoryMessageStore, MessageStore};
use crate::lock::{DistributedLock, InMemoryLockBackend, LockBackend};
use crate::template::TemplateEngine;
use crate::webhook::EventProcessor;

#[cfg(feature = "redis")]
use crate::jobs::RedisBroker;

/// Shared mailroom components
#[derive(Clone)]
pub struct Mailroom {
    config: Arc<MailroomConfig>,
    store: Arc<dyn MessageStore>,
    broker: Arc<dyn JobBroker>,
    templates: Arc<TemplateEngine>,
    mailer: Arc<FailoverManager>,
    #[cfg(feature = "redis")]
    redis_broker: Option<Arc<RedisBroker>>,
}

impl std::fmt::Debug for Mailroom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailroom")
            .field("templates", &self.templates)
            .field("mailer", &self.mailer)
            .finish_non_exhaustive()
    }
}

impl Mailroom {
    /// Connect to Redis and Postgres and build every component
    ///
    /// Runs the bootstrap migration when `database.migrate_on_start` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection cannot be established, the migration
    /// fails, or a provider is misconfigured
    #[cfg(all(feature = "redis", feature = "postgres"))]
    pub async fn connect(config: MailroomConfig) -> anyhow::Result<Self> {
        use crate::lifecycle::PgMessageStore;
        use crate::lock::RedisLockBackend;
        use sqlx::postgres::PgPoolOptions;

        let redis = deadpool_redis::Config::from_url(config.redis.url.clone())
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .context("Failed to create Redis pool")?;

        let pg = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.url)
            .await
            .context("Failed to connect to Postgres")?;
        let store = PgMessageStore::new(pg);
        if config.database.migrate_on_start {
            store.migrate().await.context("Failed to migrate message store")?;
        }

        let broker = Arc::new(RedisBroker::new(
            redis.clone(),
            &config.redis.queue_prefix,
            Backoff::from_settings(&config.worker),
            config.worker.max_attempts,
        ));

        let mut mailroom = Self::assemble(
            config,
            Arc::new(store),
            broker.clone(),
            Arc::new(RedisLockBackend::new(redis)),
        )
        .await?;
        mailroom.redis_broker = Some(broker);

        info!("Connected to Redis and Postgres");
        Ok(mailroom)
    }

    /// Build every component in process memory
    ///
    /// Locks, queue and message rows live only as long as this process.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider is misconfigured
    pub async fn in_memory(config: MailroomConfig) -> anyhow::Result<Self> {
        let broker = Arc::new(InMemoryBroker::new(
            Backoff::from_settings(&config.worker),
            config.worker.max_attempts,
        ));
        Self::assemble(
            config,
            Arc::new(InMemoryMessageStore::new()),
            broker,
            Arc::new(InMemoryLockBackend::new()),
        )
        .await
    }

    async fn assemble(
        config: MailroomConfig,
        store: Arc<dyn MessageStore>,
        broker: Arc<dyn JobBroker>,
        lock_backend: Arc<dyn LockBackend>,
    ) -> anyhow::Result<Self> {
        let lock = DistributedLock::with_settings(lock_backend, &config.lock);
        let templates = Arc::new(TemplateEngine::from_settings(&config.templates, lock));

        let primary = provider_from_settings(&config.providers.primary)
            .await
            .context("Failed to configure primary provider")?;
        let secondary = match &config.providers.secondary {
            Some(settings) => Some(
                provider_from_settings(settings)
                    .await
                    .context("Failed to configure secondary provider")?,
            ),
            None => None,
        };
        let mailer = Arc::new(FailoverManager::with_settings(
            primary,
            secondary,
            &config.circuit_breaker,
        ));

        info!(mailer = ?mailer, "Mailroom assembled");
        Ok(Self {
            config: Arc::new(config),
            store,
            broker,
            templates,
            mailer,
            #[cfg(feature = "redis")]
            redis_broker: None,
        })
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &MailroomConfig {
        &self.config
    }

    /// Message store
    #[must_use]
    pub fn store(&self) -> Arc<dyn MessageStore> {
        self.store.clone()
    }

    /// Job broker
    #[must_use]
    pub fn broker(&self) -> Arc<dyn JobBroker> {
        self.broker.clone()
    }

    /// Redis broker, when connected to Redis
    #[cfg(feature = "redis")]
    #[must_use]
    pub fn redis_broker(&self) -> Option<Arc<RedisBroker>> {
        self.redis_broker.clone()
    }

    /// Template engine
    #[must_use]
    pub fn templates(&self) -> Arc<TemplateEngine> {
        self.templates.clone()
    }

    /// Failover manager
    #[must_use]
    pub fn mailer(&self) -> Arc<FailoverManager> {
        self.mailer.clone()
    }

    /// Ingress facade
    #[must_use]
    pub fn mail_service(&self) -> MailService {
        MailService::new(self.store(), self.broker())
    }

    /// Webhook event processor
    #[must_use]
    pub fn events(&self) -> EventProcessor {
        EventProcessor::new(self.store())
    }

    /// Delivery pipeline
    #[must_use]
    pub fn pipeline(&self) -> Arc<DeliveryPipeline> {
        Arc::new(DeliveryPipeline::new(
            self.store(),
            self.templates(),
            self.mailer(),
            self.config.providers.from_address.clone(),
        ))
    }

    /// Start the configured worker pool
    #[must_use]
    pub fn spawn_workers(&self) -> WorkerPool {
        WorkerPool::spawn(self.broker(), self.pipeline(), &self.config.worker)
    }
}
