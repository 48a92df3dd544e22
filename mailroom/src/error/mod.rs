//! Error types and error handling

use thiserror::Error;

use crate::email::EmailError;
use crate::jobs::JobError;
use crate::lifecycle::StoreError;
use crate::template::TemplateError;

/// Anything that can stop a delivery attempt
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Template resolution or rendering error
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Provider error
    #[error(transparent)]
    Email(#[from] EmailError),

    /// Message store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Broker error
    #[error(transparent)]
    Job(#[from] JobError),
}

impl DeliveryError {
    /// Whether another attempt may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Template(e) => e.is_retryable(),
            Self::Email(e) => e.is_retryable(),
            Self::Store(e) => e.is_retryable(),
            Self::Job(e) => e.is_retryable(),
        }
    }

    /// Text recorded as a failed message's `error_message`
    #[must_use]
    pub fn failure_reason(&self) -> String {
        match self {
            Self::Email(e) => e.failure_reason(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{MessageId, MessageStatus};
    use std::time::Duration;

    #[test]
    fn test_classification() {
        let retryable: Vec<DeliveryError> = vec![
            TemplateError::RenderTimeout {
                name: "welcome".into(),
                timeout: Duration::from_millis(200),
            }
            .into(),
            TemplateError::Lock(crate::lock::LockError::Timeout {
                key: "lock:compile:welcome".into(),
                waited: Duration::from_secs(5),
            })
            .into(),
            EmailError::send_failed("smtp", "SMTP timeout").into(),
            EmailError::NoSecondaryProvider { primary_reason: None }.into(),
        ];
        for err in &retryable {
            assert!(err.is_retryable(), "{err}");
        }

        let fatal: Vec<DeliveryError> = vec![
            TemplateError::NotFound { name: "nope".into() }.into(),
            TemplateError::BuildFailed {
                name: "broken".into(),
                message: "line 1: unexpected end".into(),
            }
            .into(),
            TemplateError::RenderFailed {
                name: "welcome".into(),
                message: "unknown filter".into(),
            }
            .into(),
            EmailError::InvalidAddress("nobody".into()).into(),
            StoreError::InvalidTransition {
                id: MessageId::new(),
                from: MessageStatus::Failed,
                to: MessageStatus::Processing,
            }
            .into(),
        ];
        for err in &fatal {
            assert!(!err.is_retryable(), "{err}");
        }
    }

    #[test]
    fn test_failure_reason_prefers_provider_text() {
        let err = DeliveryError::from(EmailError::send_failed("smtp-primary", "SMTP timeout"));
        assert_eq!(err.failure_reason(), "SMTP timeout");

        let err = DeliveryError::from(TemplateError::NotFound { name: "nope".into() });
        assert_eq!(err.failure_reason(), "template not found: nope");
    }
}
