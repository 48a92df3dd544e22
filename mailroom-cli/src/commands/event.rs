//! Webhook event command
//!
//! Replays a provider webhook body against the message store, for backfills
//! and for wiring a webhook receiver that shells out.

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use mailroom::config::MailroomConfig;
use mailroom::state::Mailroom;
use mailroom::webhook;
use std::io::Read;
use std::path::PathBuf;

use super::{INFO, SUCCESS};

/// Apply a provider webhook payload
#[derive(Debug, Args)]
pub struct EventCommand {
    /// Provider that produced the payload (`ses` or `sendgrid`)
    provider: String,

    /// File containing the JSON body; reads stdin when omitted or `-`
    file: Option<PathBuf>,
}

impl EventCommand {
    /// Execute the event command
    ///
    /// # Errors
    ///
    /// Returns an error if the body cannot be read or parsed, or the store
    /// cannot be reached
    pub async fn execute(&self, config: MailroomConfig) -> Result<()> {
        let raw = self.read_body()?;
        let body = serde_json::from_str(&raw).context("Webhook body is not valid JSON")?;
        let events = webhook::parse(&self.provider, &body)?;

        if events.is_empty() {
            println!("{INFO} No delivery events in payload");
            return Ok(());
        }

        let mailroom = Mailroom::connect(config).await?;
        let summary = mailroom.events().apply_all(events).await?;

        println!(
            "{SUCCESS} Applied {} events, {} unmatched",
            style(summary.applied).green(),
            style(summary.unmatched).yellow()
        );
        Ok(())
    }

    fn read_body(&self) -> Result<String> {
        match &self.file {
            Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display())),
            _ => {
                let mut body = String::new();
                std::io::stdin()
                    .read_to_string(&mut body)
                    .context("Failed to read stdin")?;
                Ok(body)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_body_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(&path, r#"{"eventType": "Delivery"}"#).unwrap();

        let cmd = EventCommand {
            provider: "ses".into(),
            file: Some(path),
        };
        assert_eq!(cmd.read_body().unwrap(), r#"{"eventType": "Delivery"}"#);
    }
}
