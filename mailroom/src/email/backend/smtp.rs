//! SMTP provider
//!
//! Uses the `lettre` crate. The transport keeps a connection pool, so one
//! provider instance is shared by all workers.

use async_trait::async_trait;
use lettre::{
    message::{header, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::config::SmtpSettings;
use crate::email::{EmailError, EmailProvider, OutboundEmail, SendReceipt};

/// SMTP email provider
///
/// Every message gets an explicit `Message-ID`, which is returned as the
/// provider message id so bounces and delivery reports can be correlated.
pub struct SmtpProvider {
    label: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl std::fmt::Debug for SmtpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpProvider")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl SmtpProvider {
    /// Create a provider from configuration
    ///
    /// No connection is opened until the first send.
    ///
    /// # Errors
    ///
    /// Returns `EmailError::ConfigError` if the relay host is invalid
    pub fn new(settings: &SmtpSettings) -> Result<Self, EmailError> {
        Ok(Self {
            label: settings.label().to_string(),
            transport: Self::create_transport(settings)?,
        })
    }

    fn create_transport(
        settings: &SmtpSettings,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, EmailError> {
        let mut builder = if settings.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                .map_err(|e| EmailError::config(format!("SMTP relay {}: {e}", settings.host)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
        };

        builder = builder
            .port(settings.port)
            .timeout(Some(Duration::from_secs(settings.timeout_secs)));

        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(builder.build())
    }

    /// Build a lettre message carrying `message_id`
    fn build_message(email: &OutboundEmail, message_id: &str) -> Result<Message, EmailError> {
        let from: Mailbox = email
            .from
            .parse()
            .map_err(|_| EmailError::InvalidAddress(email.from.clone()))?;
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|_| EmailError::InvalidAddress(email.to.clone()))?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(email.subject.clone())
            .message_id(Some(format!("<{message_id}>")))
            .header(header::ContentType::TEXT_HTML)
            .body(email.html.clone())
            .map_err(|e| EmailError::InvalidAddress(e.to_string()))
    }

    fn new_message_id(from: &str) -> String {
        let domain = from
            .rsplit_once('@')
            .map(|(_, domain)| domain.trim_end_matches('>'))
            .filter(|domain| !domain.is_empty())
            .unwrap_or("mailroom.localhost");
        format!("{}@{domain}", Uuid::new_v4().simple())
    }
}

#[async_trait]
impl EmailProvider for SmtpProvider {
    fn name(&self) -> &str {
        &self.label
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, EmailError> {
        let message_id = Self::new_message_id(&email.from);
        let message = Self::build_message(email, &message_id)?;

        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| EmailError::send_failed(&self.label, e.to_string()))?;

        debug!(
            provider = %self.label,
            code = %response.code(),
            message_id = %message_id,
            "SMTP relay accepted message"
        );

        Ok(SendReceipt {
            provider_message_id: message_id,
            provider: self.label.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email() -> OutboundEmail {
        OutboundEmail::new(
            "recipient@example.com",
            "Mailroom <noreply@example.com>",
            "Welcome",
            "<h1>Hello</h1>",
        )
    }

    #[test]
    fn test_build_message_sets_message_id() {
        let message = SmtpProvider::build_message(&email(), "abc123@example.com").unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Message-ID: <abc123@example.com>"));
        assert!(raw.contains("Subject: Welcome"));
    }

    #[test]
    fn test_build_message_rejects_bad_recipient() {
        let mut email = email();
        email.to = "not an address".to_string();
        assert!(matches!(
            SmtpProvider::build_message(&email, "id@example.com"),
            Err(EmailError::InvalidAddress(addr)) if addr == "not an address"
        ));
    }

    #[test]
    fn test_message_id_uses_sender_domain() {
        let id = SmtpProvider::new_message_id("Mailroom <noreply@acme.test>");
        assert!(id.ends_with("@acme.test"));
        assert!(SmtpProvider::new_message_id("nobody").ends_with("@mailroom.localhost"));
    }

    #[tokio::test]
    async fn test_new_uses_configured_label() {
        let settings = SmtpSettings {
            label: Some("smtp-primary".to_string()),
            host: "localhost".to_string(),
            port: 2525,
            starttls: false,
            ..SmtpSettings::default()
        };
        let provider = SmtpProvider::new(&settings).unwrap();
        assert_eq!(provider.name(), "smtp-primary");
    }
}
