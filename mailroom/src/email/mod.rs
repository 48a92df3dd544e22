//! Outbound email delivery
//!
//! Providers implement [`EmailProvider`]. The [`FailoverManager`] puts a
//! circuit breaker in front of a primary provider and falls back to an
//! optional secondary.
//!
//! Backends:
//! - [`SmtpProvider`] via `lettre`
//! - [`SesProvider`] via the AWS SDK (feature `aws-ses`)
//! - [`ConsoleProvider`] for development

mod backend;
mod error;
mod failover;
mod provider;

pub use backend::{provider_from_settings, ConsoleProvider, SmtpProvider};
#[cfg(feature = "aws-ses")]
pub use backend::SesProvider;
pub use error::EmailError;
pub use failover::{CircuitSnapshot, CircuitState, FailoverManager};
pub use provider::EmailProvider;

use serde::{Deserialize, Serialize};

/// A fully rendered message ready for a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEmail {
    /// Recipient address
    pub to: String,
    /// Sender address
    pub from: String,
    /// Subject line
    pub subject: String,
    /// HTML body
    pub html: String,
}

impl OutboundEmail {
    /// Create a message
    #[must_use]
    pub fn new(
        to: impl Into<String>,
        from: impl Into<String>,
        subject: impl Into<String>,
        html: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            from: from.into(),
            subject: subject.into(),
            html: html.into(),
        }
    }
}

/// Provider acknowledgement of an accepted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Identifier the provider will use in delivery events
    pub provider_message_id: String,
    /// Label of the provider that accepted the message
    pub provider: String,
}
