//! Provider implementations

#[cfg(feature = "aws-ses")]
mod aws_ses;
mod console;
mod smtp;

#[cfg(feature = "aws-ses")]
pub use aws_ses::SesProvider;
pub use console::ConsoleProvider;
pub use smtp::SmtpProvider;

use std::sync::Arc;

use super::{EmailError, EmailProvider};
use crate::config::ProviderSettings;

/// Construct the provider described by `settings`
///
/// # Errors
///
/// Returns `EmailError::ConfigError` for invalid settings, or when SES is
/// selected in a build without the `aws-ses` feature
pub async fn provider_from_settings(
    settings: &ProviderSettings,
) -> Result<Arc<dyn EmailProvider>, EmailError> {
    match settings {
        ProviderSettings::Smtp(smtp) => Ok(Arc::new(SmtpProvider::new(smtp)?)),
        #[cfg(feature = "aws-ses")]
        ProviderSettings::Ses(ses) => Ok(Arc::new(SesProvider::from_settings(ses).await)),
        #[cfg(not(feature = "aws-ses"))]
        ProviderSettings::Ses(_) => Err(EmailError::config(
            "SES provider selected but mailroom was built without the `aws-ses` feature",
        )),
        ProviderSettings::Console => Ok(Arc::new(ConsoleProvider::new())),
    }
}
