//! Console provider for development
//!
//! Logs messages instead of sending them.

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use crate::email::{EmailError, EmailProvider, OutboundEmail, SendReceipt};

/// Console email provider
///
/// Accepts every message and returns a generated `console-<uuid>` id.
#[derive(Debug, Clone, Default)]
pub struct ConsoleProvider {
    verbose: bool,
}

impl ConsoleProvider {
    /// Create a console provider
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a console provider that also logs the HTML body
    #[must_use]
    pub const fn verbose() -> Self {
        Self { verbose: true }
    }
}

#[async_trait]
impl EmailProvider for ConsoleProvider {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, EmailError> {
        let provider_message_id = format!("console-{}", Uuid::new_v4());

        info!(
            from = %email.from,
            to = %email.to,
            subject = %email.subject,
            message_id = %provider_message_id,
            "Console email sent"
        );
        if self.verbose {
            debug!(html = %email.html, "Console email body");
        }

        Ok(SendReceipt {
            provider_message_id,
            provider: self.name().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_console_accepts_everything() {
        let email = OutboundEmail::new("a@example.com", "b@example.com", "Hi", "<p>Hi</p>");
        let first = ConsoleProvider::new().send(&email).await.unwrap();
        let second = ConsoleProvider::verbose().send(&email).await.unwrap();

        assert_eq!(first.provider, "console");
        assert!(first.provider_message_id.starts_with("console-"));
        assert_ne!(first.provider_message_id, second.provider_message_id);
    }
}
