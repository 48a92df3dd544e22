//! AWS SES provider
//!
//! Uses the SES v2 API. Requires the `aws-ses` feature.

use async_trait::async_trait;
use aws_sdk_sesv2::{
    error::DisplayErrorContext,
    types::{Body, Content, Destination, EmailContent, Message},
    Client,
};

use crate::config::SesSettings;
use crate::email::{EmailError, EmailProvider, OutboundEmail, SendReceipt};

/// AWS SES email provider
///
/// The SES `MessageId` is returned as the provider message id; SES event
/// publishing reports the same id in `mail.messageId`.
#[derive(Debug, Clone)]
pub struct SesProvider {
    label: String,
    client: Client,
}

impl SesProvider {
    /// Create a provider around an existing client
    #[must_use]
    pub fn new(label: impl Into<String>, client: Client) -> Self {
        Self {
            label: label.into(),
            client,
        }
    }

    /// Create a provider using the default AWS credential chain
    ///
    /// The chain checks environment variables, the shared credentials file
    /// and instance metadata, in that order.
    pub async fn from_settings(settings: &SesSettings) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let config = loader.load().await;
        Self::new(settings.label(), Client::new(&config))
    }

    fn build_content(&self, email: &OutboundEmail) -> Result<EmailContent, EmailError> {
        let content = |data: &str| {
            Content::builder()
                .data(data)
                .charset("UTF-8")
                .build()
                .map_err(|e| EmailError::send_failed(&self.label, format!("invalid content: {e}")))
        };

        let message = Message::builder()
            .subject(content(&email.subject)?)
            .body(Body::builder().html(content(&email.html)?).build())
            .build();

        Ok(EmailContent::builder().simple(message).build())
    }
}

#[async_trait]
impl EmailProvider for SesProvider {
    fn name(&self) -> &str {
        &self.label
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, EmailError> {
        let content = self.build_content(email)?;

        let output = self
            .client
            .send_email()
            .from_email_address(&email.from)
            .destination(Destination::builder().to_addresses(&email.to).build())
            .content(content)
            .send()
            .await
            .map_err(|e| EmailError::send_failed(&self.label, DisplayErrorContext(&e).to_string()))?;

        let provider_message_id = output
            .message_id()
            .map(str::to_string)
            .ok_or_else(|| EmailError::send_failed(&self.label, "SES response carried no MessageId"))?;

        Ok(SendReceipt {
            provider_message_id,
            provider: self.label.clone(),
        })
    }
}
