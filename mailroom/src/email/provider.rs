//! Email provider trait abstraction

use async_trait::async_trait;

use super::{EmailError, OutboundEmail, SendReceipt};

/// A service that accepts outbound messages (SMTP relay, SES, ...)
///
/// Implementations must surface every failure as an error; a provider that
/// swallows errors would make the failover circuit blind.
///
/// # Examples
///
/// ```rust
/// use mailroom::email::{ConsoleProvider, EmailProvider, OutboundEmail};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let provider = ConsoleProvider::new();
///
/// let email = OutboundEmail::new(
///     "user@example.com",
///     "noreply@example.com",
///     "Welcome!",
///     "<p>Hello</p>",
/// );
///
/// let receipt = provider.send(&email).await?;
/// assert_eq!(receipt.provider, "console");
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Label recorded as the message's provider
    fn name(&self) -> &str;

    /// Hand the message to the provider
    ///
    /// # Errors
    ///
    /// Returns `EmailError` if the provider does not accept the message
    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, EmailError>;
}
