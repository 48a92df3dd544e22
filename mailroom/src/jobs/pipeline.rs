//! Per-job delivery state machine
//!
//! ```text
//! dequeue ─> processing ─> resolve + render ─> send ─> sent      (Sent)
//!                │                │              │
//!                │                └──────┬───────┘
//!                │                   error
//!                │          retryable and attempts left ─> (Retry)
//!                │          otherwise ─> failed           (Failed)
//!                └─ already sent / settled ─> (Skipped)
//! ```
//!
//! Status stays `processing` between attempts. Only the attempt that gives up
//! writes `failed`, so a message is marked failed at most once.
//!
//! Once a provider has accepted the message the job is never retried and the
//! row is never marked `failed`. The `sent` write itself is retried in place a
//! few times; if it still cannot be recorded the outcome is
//! [`JobOutcome::SentUnrecorded`] and the receipt is logged for reconciliation.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::Delivery;
use crate::email::{FailoverManager, OutboundEmail, SendReceipt};
use crate::error::DeliveryError;
use crate::lifecycle::{MessageId, MessageStatus, MessageStore, StoreError, Transition};
use crate::template::TemplateEngine;

const SENT_WRITE_ATTEMPTS: u32 = 3;
const SENT_WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// What the worker should tell the broker about a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// A provider accepted the message
    Sent(SendReceipt),
    /// A provider accepted the message but the `sent` status could not be
    /// written; the job must not be retried
    SentUnrecorded {
        /// Provider acknowledgement
        receipt: SendReceipt,
        /// Store error from the last write attempt
        error: String,
    },
    /// The message was already dispatched or settled; nothing was done
    Skipped {
        /// Status found on the message
        status: MessageStatus,
    },
    /// Transient failure with attempts left; schedule another attempt
    Retry {
        /// Error from this attempt
        error: String,
    },
    /// Permanent failure or attempts exhausted; the message is `failed`
    Failed {
        /// Recorded failure reason
        error: String,
    },
}

/// Renders and sends one job, recording progress in the message store
pub struct DeliveryPipeline {
    store: Arc<dyn MessageStore>,
    templates: Arc<TemplateEngine>,
    mailer: Arc<FailoverManager>,
    from_address: String,
}

impl std::fmt::Debug for DeliveryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPipeline")
            .field("mailer", &self.mailer)
            .field("from_address", &self.from_address)
            .finish_non_exhaustive()
    }
}

impl DeliveryPipeline {
    /// Assemble a pipeline
    #[must_use]
    pub fn new(
        store: Arc<dyn MessageStore>,
        templates: Arc<TemplateEngine>,
        mailer: Arc<FailoverManager>,
        from_address: impl Into<String>,
    ) -> Self {
        Self {
            store,
            templates,
            mailer,
            from_address: from_address.into(),
        }
    }

    /// Message store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Run one delivery to an outcome
    ///
    /// Never returns an error: failures are folded into [`JobOutcome`].
    pub async fn handle(&self, delivery: &Delivery) -> JobOutcome {
        let span = info_span!(
            "job",
            job_id = %delivery.id,
            message_id = %delivery.job.message_id,
            template = %delivery.job.template,
            attempt = delivery.attempt,
            trace_id = delivery.job.trace_id.as_deref().unwrap_or(""),
        );

        async {
            match self.deliver(delivery).await {
                Ok(outcome) => outcome,
                Err(err) => self.settle_failure(delivery, &err).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn deliver(&self, delivery: &Delivery) -> Result<JobOutcome, DeliveryError> {
        let job = &delivery.job;
        let id = job.message_id;

        let message = self
            .store
            .get(id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        if message.status.is_dispatched() || message.status.is_terminal() {
            debug!(status = %message.status, "Message already handled, skipping");
            return Ok(JobOutcome::Skipped {
                status: message.status,
            });
        }

        match self
            .store
            .transition(id, Transition::Processing { attempt: delivery.attempt })
            .await
        {
            Ok(_) => {}
            // Another delivery of the same job got there first.
            Err(StoreError::InvalidTransition { from, .. }) => {
                debug!(status = %from, "Message moved on concurrently, skipping");
                return Ok(JobOutcome::Skipped { status: from });
            }
            Err(e) => return Err(e.into()),
        }

        let html = self.templates.render(&job.template, &job.props_value()).await?;
        let email = OutboundEmail::new(&job.to, &self.from_address, job.subject_or_default(), html);

        let receipt = self.mailer.send(&email).await?;
        Ok(self.record_sent(id, receipt).await)
    }

    async fn record_sent(&self, id: MessageId, receipt: SendReceipt) -> JobOutcome {
        let mut write = 1;
        loop {
            let sent = Transition::Sent {
                provider: receipt.provider.clone(),
                provider_message_id: receipt.provider_message_id.clone(),
            };
            match self.store.transition(id, sent).await {
                Ok(_) => {
                    info!(
                        provider = %receipt.provider,
                        provider_message_id = %receipt.provider_message_id,
                        "Email sent"
                    );
                    return JobOutcome::Sent(receipt);
                }
                Err(e) if e.is_retryable() && write < SENT_WRITE_ATTEMPTS => {
                    warn!(error = %e, write, "Could not record sent status, retrying");
                    tokio::time::sleep(SENT_WRITE_BACKOFF * write).await;
                    write += 1;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        provider = %receipt.provider,
                        provider_message_id = %receipt.provider_message_id,
                        "Email sent but sent status not recorded"
                    );
                    return JobOutcome::SentUnrecorded {
                        receipt,
                        error: e.to_string(),
                    };
                }
            }
        }
    }

    async fn settle_failure(&self, delivery: &Delivery, err: &DeliveryError) -> JobOutcome {
        if err.is_retryable() && !delivery.is_final_attempt() {
            warn!(
                error = %err,
                attempts_left = delivery.max_attempts - delivery.attempt,
                "Delivery attempt failed, will retry"
            );
            return JobOutcome::Retry {
                error: err.to_string(),
            };
        }

        let reason = err.failure_reason();
        error!(error = %err, retryable = err.is_retryable(), "Delivery failed permanently");

        let failed = Transition::Failed {
            error: reason.clone(),
        };
        match self.store.transition(delivery.job.message_id, failed).await {
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(e) => error!(error = %e, "Could not record failed status"),
        }

        JobOutcome::Failed { error: reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::broker::{Delivery, Envelope};
    use crate::jobs::EmailJob;
    use crate::lifecycle::{
        DeliveryOutcome, InMemoryMessageStore, Message, MockMessageStore, NewMessage,
    };
    use crate::lock::{DistributedLock, InMemoryLockBackend};
    use crate::template::{ArtifactCache, MiniJinjaBuilder, Renderer, TemplateLayout};
    use crate::testing::ScriptedProvider;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<InMemoryMessageStore>,
        pipeline: DeliveryPipeline,
    }

    fn engine(dir: &TempDir) -> Arc<TemplateEngine> {
        let layout = TemplateLayout::new(dir.path().join("src"), dir.path().join("dist"), "html");
        let cache = ArtifactCache::new(
            layout,
            DistributedLock::new(Arc::new(InMemoryLockBackend::new())),
            Arc::new(MiniJinjaBuilder::new()),
            Duration::from_secs(30),
        );
        Arc::new(TemplateEngine::new(cache, Renderer::new(), Duration::from_millis(200)))
    }

    fn fixture(primary: ScriptedProvider) -> Fixture {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/welcome.html"), "<p>Hi {{ name }}</p>").unwrap();

        let store = Arc::new(InMemoryMessageStore::new());
        let mailer = Arc::new(FailoverManager::new(Arc::new(primary), None));
        let pipeline =
            DeliveryPipeline::new(store.clone(), engine(&dir), mailer, "noreply@example.com");
        Fixture {
            _dir: dir,
            store,
            pipeline,
        }
    }

    async fn queued(store: &InMemoryMessageStore, template: &str) -> EmailJob {
        let message = store
            .create(&NewMessage {
                id: MessageId::new(),
                client_id: "client-1".into(),
                trace_id: None,
                template_name: template.into(),
                recipient: "user@example.com".into(),
                subject: None,
            })
            .await
            .unwrap();

        EmailJob {
            to: message.recipient,
            template: message.template_name,
            props: json!({"name": "Ada"}).as_object().cloned().unwrap(),
            subject: None,
            message_id: message.id,
            client_id: message.client_id,
            trace_id: None,
        }
    }

    /// In-memory store whose first `failures` sent writes return `error()`
    struct FlakySentWrites {
        inner: InMemoryMessageStore,
        failures: AtomicUsize,
        error: fn() -> StoreError,
    }

    impl FlakySentWrites {
        fn new(failures: usize, error: fn() -> StoreError) -> Self {
            Self {
                inner: InMemoryMessageStore::new(),
                failures: AtomicUsize::new(failures),
                error,
            }
        }
    }

    #[async_trait::async_trait]
    impl MessageStore for FlakySentWrites {
        async fn create(&self, message: &NewMessage) -> Result<Message, StoreError> {
            self.inner.create(message).await
        }

        async fn get(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
            self.inner.get(id).await
        }

        async fn transition(&self, id: MessageId, transition: Transition) -> Result<Message, StoreError> {
            if matches!(transition, Transition::Sent { .. })
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err((self.error)());
            }
            self.inner.transition(id, transition).await
        }

        async fn transition_by_provider_id(
            &self,
            provider_message_id: &str,
            outcome: DeliveryOutcome,
        ) -> Result<Option<Message>, StoreError> {
            self.inner
                .transition_by_provider_id(provider_message_id, outcome)
                .await
        }
    }

    fn over_store(
        dir: &TempDir,
        store: Arc<dyn MessageStore>,
        provider: Arc<ScriptedProvider>,
    ) -> DeliveryPipeline {
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/welcome.html"), "<p>Hi {{ name }}</p>").unwrap();
        DeliveryPipeline::new(
            store,
            engine(dir),
            Arc::new(FailoverManager::new(provider, None)),
            "noreply@example.com",
        )
    }

    fn attempt(job: EmailJob, attempt: u32) -> Delivery {
        let mut envelope = Envelope::new(job, 3);
        envelope.attempt = attempt;
        Delivery::from_envelope(envelope, String::new())
    }

    #[tokio::test]
    async fn test_happy_path_marks_sent() {
        let fx = fixture(ScriptedProvider::succeeding("smtp"));
        let job = queued(&fx.store, "welcome").await;
        let id = job.message_id;

        let outcome = fx.pipeline.handle(&attempt(job, 1)).await;
        let JobOutcome::Sent(receipt) = outcome else {
            panic!("expected Sent, got {outcome:?}");
        };

        let message = fx.store.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.attempts, 1);
        assert_eq!(message.provider_msg_id, Some(receipt.provider_message_id));
    }

    #[tokio::test]
    async fn test_rendered_body_and_default_subject_reach_provider() {
        let provider = Arc::new(ScriptedProvider::succeeding("smtp"));
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/welcome.html"), "<p>Hi {{ name }}</p>").unwrap();
        let store = Arc::new(InMemoryMessageStore::new());
        let pipeline = DeliveryPipeline::new(
            store.clone(),
            engine(&dir),
            Arc::new(FailoverManager::new(provider.clone(), None)),
            "noreply@example.com",
        );

        let job = queued(&store, "welcome").await;
        pipeline.handle(&attempt(job, 1)).await;

        let sent = provider.accepted();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].html, "<p>Hi Ada</p>");
        assert_eq!(sent[0].subject, "No Subject");
        assert_eq!(sent[0].from, "noreply@example.com");
    }

    #[tokio::test]
    async fn test_retryable_failure_keeps_processing() {
        let fx = fixture(ScriptedProvider::failing("smtp", "SMTP timeout"));
        let job = queued(&fx.store, "welcome").await;
        let id = job.message_id;

        let outcome = fx.pipeline.handle(&attempt(job.clone(), 1)).await;
        assert!(matches!(outcome, JobOutcome::Retry { .. }), "{outcome:?}");
        let outcome = fx.pipeline.handle(&attempt(job, 2)).await;
        assert!(matches!(outcome, JobOutcome::Retry { .. }), "{outcome:?}");

        let message = fx.store.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Processing);
        assert_eq!(message.attempts, 2);
        assert!(message.error_message.is_none());
    }

    #[tokio::test]
    async fn test_final_attempt_marks_failed_with_provider_reason() {
        let fx = fixture(ScriptedProvider::failing("smtp", "SMTP timeout"));
        let job = queued(&fx.store, "welcome").await;
        let id = job.message_id;

        let outcome = fx.pipeline.handle(&attempt(job, 3)).await;
        assert_eq!(
            outcome,
            JobOutcome::Failed {
                error: "SMTP timeout".into()
            }
        );

        let message = fx.store.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.error_message.as_deref(), Some("SMTP timeout"));
        assert_eq!(message.attempts, 3);
    }

    #[tokio::test]
    async fn test_missing_template_fails_immediately() {
        let fx = fixture(ScriptedProvider::succeeding("smtp"));
        let job = queued(&fx.store, "does-not-exist").await;
        let id = job.message_id;

        let outcome = fx.pipeline.handle(&attempt(job, 1)).await;
        assert!(matches!(outcome, JobOutcome::Failed { .. }), "{outcome:?}");
        assert_eq!(
            fx.store.get(id).await.unwrap().unwrap().status,
            MessageStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_redelivery_after_send_is_skipped() {
        let provider = ScriptedProvider::succeeding("smtp");
        let fx = fixture(provider);
        let job = queued(&fx.store, "welcome").await;

        assert!(matches!(
            fx.pipeline.handle(&attempt(job.clone(), 1)).await,
            JobOutcome::Sent(_)
        ));
        assert_eq!(
            fx.pipeline.handle(&attempt(job, 1)).await,
            JobOutcome::Skipped {
                status: MessageStatus::Sent
            }
        );
    }

    #[tokio::test]
    async fn test_missing_message_row_fails_without_sending() {
        let dir = TempDir::new().unwrap();
        let mut store = MockMessageStore::new();
        store.expect_get().times(1).returning(|_| Ok(None));
        store
            .expect_transition()
            .times(1)
            .returning(|id, _| Err(StoreError::NotFound(id)));
        store.expect_create().never();

        let pipeline = DeliveryPipeline::new(
            Arc::new(store),
            engine(&dir),
            Arc::new(FailoverManager::new(
                Arc::new(ScriptedProvider::succeeding("smtp")),
                None,
            )),
            "noreply@example.com",
        );

        let job = EmailJob {
            to: "user@example.com".into(),
            template: "welcome".into(),
            props: serde_json::Map::new(),
            subject: None,
            message_id: MessageId::new(),
            client_id: "client-1".into(),
            trace_id: None,
        };

        let outcome = pipeline.handle(&attempt(job, 1)).await;
        assert!(matches!(outcome, JobOutcome::Failed { .. }), "{outcome:?}");
    }

    #[tokio::test]
    async fn test_unrecorded_send_is_neither_retried_nor_failed() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FlakySentWrites::new(usize::MAX, || {
            StoreError::Corrupt("row unreadable".into())
        }));
        let provider = Arc::new(ScriptedProvider::succeeding("smtp"));
        let pipeline = over_store(&dir, store.clone(), provider.clone());

        for attempt_no in [1, 3] {
            let job = queued(&store.inner, "welcome").await;
            let id = job.message_id;

            let outcome = pipeline.handle(&attempt(job, attempt_no)).await;
            assert!(
                matches!(outcome, JobOutcome::SentUnrecorded { .. }),
                "attempt {attempt_no}: {outcome:?}"
            );

            let message = store.get(id).await.unwrap().unwrap();
            assert_eq!(message.status, MessageStatus::Processing);
            assert!(message.error_message.is_none());
        }
        assert_eq!(provider.calls(), 2);
    }

    #[cfg(feature = "postgres")]
    #[tokio::test]
    async fn test_transient_sent_write_failure_is_retried_in_place() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FlakySentWrites::new(2, || {
            StoreError::Database(sqlx::Error::PoolTimedOut)
        }));
        let provider = Arc::new(ScriptedProvider::succeeding("smtp"));
        let pipeline = over_store(&dir, store.clone(), provider.clone());

        let job = queued(&store.inner, "welcome").await;
        let id = job.message_id;

        let outcome = pipeline.handle(&attempt(job, 3)).await;
        let JobOutcome::Sent(receipt) = outcome else {
            panic!("expected Sent, got {outcome:?}");
        };

        let message = store.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.provider_msg_id, Some(receipt.provider_message_id));
        assert_eq!(provider.calls(), 1);
    }

    #[cfg(feature = "postgres")]
    #[tokio::test]
    async fn test_persistent_sent_write_failure_on_final_attempt_keeps_row() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FlakySentWrites::new(usize::MAX, || {
            StoreError::Database(sqlx::Error::PoolTimedOut)
        }));
        let provider = Arc::new(ScriptedProvider::succeeding("smtp"));
        let pipeline = over_store(&dir, store.clone(), provider.clone());

        let job = queued(&store.inner, "welcome").await;
        let id = job.message_id;

        let outcome = pipeline.handle(&attempt(job, 3)).await;
        let JobOutcome::SentUnrecorded { receipt, error } = outcome else {
            panic!("expected SentUnrecorded, got {outcome:?}");
        };
        assert_eq!(receipt.provider, "smtp");
        assert!(error.contains("pool timed out"), "{error}");

        let message = store.get(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Processing);
        assert_eq!(provider.calls(), 1);
    }
}
