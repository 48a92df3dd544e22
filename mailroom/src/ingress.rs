//! Send request intake
//!
//! The entry point an HTTP or RPC layer calls: it records the message as
//! `queued` and enqueues the delivery job. Authentication, request-rate
//! limiting and transport concerns stay in that outer layer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::jobs::{EmailJob, JobBroker, JobError, JobId};
use crate::lifecycle::{MessageId, MessageStore, NewMessage, StoreError};
use crate::template::{validate_name, TemplateError};

/// A request to send one templated email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Recipient address
    pub to: String,
    /// Template name
    pub template: String,
    /// Subject line
    #[serde(default)]
    pub subject: Option<String>,
    /// Template variables
    #[serde(default)]
    pub props: Map<String, Value>,
}

/// Caller identity attached to a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMeta {
    /// Authenticated client
    pub client_id: String,
    /// Correlation id
    #[serde(default)]
    pub trace_id: Option<String>,
}

/// Acknowledgement returned to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    /// ID to poll for status
    pub message_id: MessageId,
    /// Always `"accepted"`
    pub status: String,
    /// Broker job carrying the delivery
    #[serde(skip)]
    pub job_id: Option<JobId>,
}

/// Errors rejecting or failing to accept a request
#[derive(Debug, Error)]
pub enum IngressError {
    /// Request failed validation
    #[error("invalid request: {0}")]
    Invalid(String),

    /// The message could not be recorded
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The message was recorded but its job could not be enqueued; the row
    /// stays `queued` until it is re-enqueued or cleaned up
    #[error("message {message_id} recorded but not enqueued: {source}")]
    Queue {
        /// Row left without a job
        message_id: MessageId,
        /// Broker failure
        #[source]
        source: JobError,
    },
}

/// Accepts send requests
pub struct MailService {
    store: Arc<dyn MessageStore>,
    broker: Arc<dyn JobBroker>,
}

impl std::fmt::Debug for MailService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailService").finish_non_exhaustive()
    }
}

impl MailService {
    /// Create a service over a store and broker
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, broker: Arc<dyn JobBroker>) -> Self {
        Self { store, broker }
    }

    /// Record and enqueue `request`
    ///
    /// The message row is written before the job is enqueued, so a worker
    /// never sees a job without its row. The reverse can happen: if the
    /// enqueue fails the row is left `queued` with no job behind it, and the
    /// returned [`IngressError::Queue`] names it so the caller can retry or
    /// reconcile. `queued` cannot move to `failed`, so it is not marked here.
    ///
    /// # Errors
    ///
    /// - `IngressError::Invalid` for an empty recipient or a bad template name
    /// - `IngressError::Store` when the row cannot be written
    /// - `IngressError::Queue` when the row was written but the enqueue failed
    #[instrument(skip_all, fields(client_id = %meta.client_id, template = %request.template))]
    pub async fn send(&self, request: SendRequest, meta: SendMeta) -> Result<Accepted, IngressError> {
        validate(&request)?;

        let message_id = MessageId::new();
        self.store
            .create(&NewMessage {
                id: message_id,
                client_id: meta.client_id.clone(),
                trace_id: meta.trace_id.clone(),
                template_name: request.template.clone(),
                recipient: request.to.clone(),
                subject: request.subject.clone(),
            })
            .await?;

        let job_id = self
            .broker
            .enqueue(EmailJob {
                to: request.to,
                template: request.template,
                props: request.props,
                subject: request.subject,
                message_id,
                client_id: meta.client_id,
                trace_id: meta.trace_id,
            })
            .await
            .map_err(|source| {
                error!(%message_id, error = %source, "Message recorded but not enqueued");
                IngressError::Queue { message_id, source }
            })?;

        info!(%message_id, %job_id, "Email accepted");
        Ok(Accepted {
            message_id,
            status: "accepted".to_string(),
            job_id: Some(job_id),
        })
    }
}

fn validate(request: &SendRequest) -> Result<(), IngressError> {
    let to = request.to.trim();
    if to.is_empty() || !to.contains('@') {
        return Err(IngressError::Invalid(format!("bad recipient '{}'", request.to)));
    }
    validate_name(&request.template).map_err(|e| match e {
        TemplateError::InvalidName { reason, .. } => {
            IngressError::Invalid(format!("bad template name '{}': {reason}", request.template))
        }
        other => IngressError::Invalid(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryBroker;
    use crate::lifecycle::{InMemoryMessageStore, MessageStatus};
    use std::time::Duration;

    fn request(to: &str, template: &str) -> SendRequest {
        SendRequest {
            to: to.into(),
            template: template.into(),
            subject: Some("Welcome!".into()),
            props: serde_json::json!({"name": "Ada"}).as_object().cloned().unwrap(),
        }
    }

    fn meta() -> SendMeta {
        SendMeta {
            client_id: "client-1".into(),
            trace_id: Some("trace-1".into()),
        }
    }

    #[tokio::test]
    async fn test_send_records_then_enqueues() {
        let store = Arc::new(InMemoryMessageStore::new());
        let broker = Arc::new(InMemoryBroker::default());
        let service = MailService::new(store.clone(), broker.clone());

        let accepted = service.send(request("user@example.com", "welcome"), meta()).await.unwrap();
        assert_eq!(accepted.status, "accepted");

        let message = store.get(accepted.message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Queued);
        assert_eq!(message.trace_id.as_deref(), Some("trace-1"));

        let delivery = broker.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(delivery.job.message_id, accepted.message_id);
        assert_eq!(delivery.job.props["name"], "Ada");
        assert_eq!(Some(delivery.id), accepted.job_id);
    }

    #[tokio::test]
    async fn test_rejects_bad_input_before_writing() {
        let store = Arc::new(InMemoryMessageStore::new());
        let broker = Arc::new(InMemoryBroker::default());
        let service = MailService::new(store.clone(), broker.clone());

        for bad in [request("", "welcome"), request("user@example.com", "../etc/passwd")] {
            assert!(matches!(service.send(bad, meta()).await, Err(IngressError::Invalid(_))));
        }
        assert!(store.is_empty());
        assert_eq!(broker.depths().await.unwrap().pending, 0);
    }

    #[test]
    fn test_accepted_wire_shape() {
        let accepted = Accepted {
            message_id: MessageId::new(),
            status: "accepted".into(),
            job_id: Some(JobId::new()),
        };
        let value = serde_json::to_value(&accepted).unwrap();
        assert_eq!(value["status"], "accepted");
        assert!(value.get("job_id").is_none());
    }

    #[tokio::test]
    async fn test_enqueue_failure_names_the_orphaned_row() {
        let store = Arc::new(InMemoryMessageStore::new());
        let broker = Arc::new(InMemoryBroker::default());
        broker.close();
        let service = MailService::new(store.clone(), broker.clone());

        let err = service
            .send(request("user@example.com", "welcome"), meta())
            .await
            .unwrap_err();
        let IngressError::Queue { message_id, source } = err else {
            panic!("expected Queue, got {err:?}");
        };
        assert!(matches!(source, JobError::Closed));

        let message = store.get(message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Queued);
        assert_eq!(store.len(), 1);
    }
}
