//! Email error types

use thiserror::Error;

/// Errors that can occur when handing a message to a provider
#[derive(Debug, Error)]
pub enum EmailError {
    /// The provider rejected or failed to accept the message
    #[error("{provider} failed to send: {reason}")]
    ProviderSendFailed {
        /// Provider label
        provider: String,
        /// Provider-reported reason
        reason: String,
    },

    /// The primary path is unavailable and there is nothing to fall back to
    #[error("primary provider unavailable and no secondary provider is configured")]
    NoSecondaryProvider {
        /// Primary failure from this request, if the primary was tried
        primary_reason: Option<String>,
    },

    /// Invalid email address format
    #[error("invalid email address: {0}")]
    InvalidAddress(String),

    /// Provider configuration error
    #[error("email configuration error: {0}")]
    ConfigError(String),
}

impl EmailError {
    /// Create a send failure attributed to `provider`
    #[must_use]
    pub fn send_failed(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProviderSendFailed {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error from a string message
    #[must_use]
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Whether a later attempt may succeed
    ///
    /// Provider outages (including a missing fallback while the primary is
    /// down) are transient; malformed messages and bad configuration are not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderSendFailed { .. } | Self::NoSecondaryProvider { .. }
        )
    }

    /// Most specific human-readable cause, as recorded on failed messages
    #[must_use]
    pub fn failure_reason(&self) -> String {
        match self {
            Self::ProviderSendFailed { reason, .. }
            | Self::NoSecondaryProvider {
                primary_reason: Some(reason),
            } => reason.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_prefers_provider_text() {
        assert_eq!(
            EmailError::send_failed("smtp", "SMTP timeout").failure_reason(),
            "SMTP timeout"
        );
        assert_eq!(
            EmailError::NoSecondaryProvider {
                primary_reason: Some("SMTP timeout".into())
            }
            .failure_reason(),
            "SMTP timeout"
        );
        assert_eq!(
            EmailError::NoSecondaryProvider { primary_reason: None }.failure_reason(),
            "primary provider unavailable and no secondary provider is configured"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(EmailError::send_failed("smtp", "421 busy").is_retryable());
        assert!(EmailError::NoSecondaryProvider { primary_reason: None }.is_retryable());
        assert!(!EmailError::InvalidAddress("nobody".into()).is_retryable());
        assert!(!EmailError::config("missing host").is_retryable());
    }
}
