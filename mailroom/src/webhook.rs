//! Provider delivery events
//!
//! Providers report what happened after they accepted a message. Two payload
//! shapes are understood:
//!
//! - SES event publishing: one object with `eventType` and `mail.messageId`,
//!   optionally wrapped in an SNS envelope whose `Message` field holds the
//!   event as a JSON string
//! - SendGrid event webhook: an array of objects with `event` and
//!   `sg_message_id`
//!
//! Events are matched to messages by provider message id only. Unknown ids
//! and unsupported event kinds are logged and dropped.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::lifecycle::{DeliveryOutcome, MessageStore, StoreError};

/// One delivery event for one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryEvent {
    /// Provider's id for the message
    pub provider_message_id: String,
    /// What happened
    pub outcome: DeliveryOutcome,
}

/// Errors parsing a webhook body
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Body is not the expected JSON shape
    #[error("malformed {provider} payload: {source}")]
    Malformed {
        /// Provider the body claimed to come from
        provider: &'static str,
        /// Decode error
        #[source]
        source: serde_json::Error,
    },

    /// Provider name in the route is not supported
    #[error("unknown webhook provider: {0}")]
    UnknownProvider(String),
}

/// Summary of one webhook batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Events that settled a message
    pub applied: usize,
    /// Events with no matching `sent` message
    pub unmatched: usize,
}

#[derive(Debug, Deserialize)]
struct SnsEnvelope {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Message")]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SesEvent {
    event_type: Option<String>,
    mail: Option<SesMail>,
    bounce: Option<SesBounce>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SesMail {
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SesBounce {
    bounce_type: Option<String>,
    bounce_sub_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendGridEvent {
    event: Option<String>,
    sg_message_id: Option<String>,
    reason: Option<String>,
}

/// Parse an SES event body
///
/// # Errors
///
/// Returns `WebhookError::Malformed` if the body is not an SES event
pub fn parse_ses(body: &Value) -> Result<Vec<DeliveryEvent>, WebhookError> {
    let malformed = |source| WebhookError::Malformed {
        provider: "ses",
        source,
    };

    let event: SesEvent = match serde_json::from_value::<SnsEnvelope>(body.clone()) {
        Ok(envelope) if envelope.kind == "Notification" => {
            serde_json::from_str(&envelope.message).map_err(malformed)?
        }
        Ok(envelope) => {
            debug!(kind = %envelope.kind, "Ignoring SNS control message");
            return Ok(Vec::new());
        }
        Err(_) => serde_json::from_value(body.clone()).map_err(malformed)?,
    };

    let (Some(kind), Some(message_id)) = (
        event.event_type,
        event.mail.and_then(|mail| mail.message_id),
    ) else {
        return Ok(Vec::new());
    };

    let outcome = match kind.as_str() {
        "Delivery" => DeliveryOutcome::Delivered,
        "Bounce" => DeliveryOutcome::Bounced {
            reason: event.bounce.and_then(|b| {
                let parts: Vec<_> = [b.bounce_type, b.bounce_sub_type].into_iter().flatten().collect();
                (!parts.is_empty()).then(|| parts.join("/"))
            }),
        },
        "Complaint" => DeliveryOutcome::Complaint,
        other => {
            debug!(event_type = other, "Ignoring SES event");
            return Ok(Vec::new());
        }
    };

    Ok(vec![DeliveryEvent {
        provider_message_id: message_id,
        outcome,
    }])
}

/// Parse a SendGrid event batch
///
/// # Errors
///
/// Returns `WebhookError::Malformed` if the body is not an array of events
pub fn parse_sendgrid(body: &Value) -> Result<Vec<DeliveryEvent>, WebhookError> {
    let events: Vec<SendGridEvent> =
        serde_json::from_value(body.clone()).map_err(|source| WebhookError::Malformed {
            provider: "sendgrid",
            source,
        })?;

    Ok(events
        .into_iter()
        .filter_map(|event| {
            let outcome = match event.event.as_deref()? {
                "delivered" => DeliveryOutcome::Delivered,
                "bounce" => DeliveryOutcome::Bounced {
                    reason: event.reason,
                },
                "spamreport" => DeliveryOutcome::Complaint,
                _ => return None,
            };
            Some(DeliveryEvent {
                provider_message_id: event.sg_message_id?,
                outcome,
            })
        })
        .collect())
}

/// Parse a body for the provider named in the webhook route
///
/// # Errors
///
/// - `WebhookError::UnknownProvider` for anything but `ses` and `sendgrid`
/// - `WebhookError::Malformed` if the body does not match the provider
pub fn parse(provider: &str, body: &Value) -> Result<Vec<DeliveryEvent>, WebhookError> {
    match provider {
        "ses" => parse_ses(body),
        "sendgrid" => parse_sendgrid(body),
        other => Err(WebhookError::UnknownProvider(other.to_string())),
    }
}

/// Applies delivery events to the message store
pub struct EventProcessor {
    store: Arc<dyn MessageStore>,
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor").finish_non_exhaustive()
    }
}

impl EventProcessor {
    /// Create a processor over `store`
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Apply one event
    ///
    /// Returns `true` when a message was updated.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` only if the store cannot be reached
    pub async fn apply(&self, event: DeliveryEvent) -> Result<bool, StoreError> {
        let DeliveryEvent {
            provider_message_id,
            outcome,
        } = event;

        match self
            .store
            .transition_by_provider_id(&provider_message_id, outcome)
            .await?
        {
            Some(message) => {
                info!(
                    message_id = %message.id,
                    status = %message.status,
                    provider_message_id = %provider_message_id,
                    "Delivery status updated"
                );
                Ok(true)
            }
            None => {
                warn!(provider_message_id = %provider_message_id, "No sent message for provider id");
                Ok(false)
            }
        }
    }

    /// Apply a batch of events
    ///
    /// # Errors
    ///
    /// Returns the first `StoreError`; earlier events stay applied
    pub async fn apply_all(&self, events: Vec<DeliveryEvent>) -> Result<ApplySummary, StoreError> {
        let mut summary = ApplySummary::default();
        for event in events {
            if self.apply(event).await? {
                summary.applied += 1;
            } else {
                summary.unmatched += 1;
            }
        }
        Ok(summary)
    }
}
