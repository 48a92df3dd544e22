//! Send command

use anyhow::{bail, Context, Result};
use clap::Args;
use console::style;
use mailroom::config::MailroomConfig;
use mailroom::ingress::{SendMeta, SendRequest};
use mailroom::state::Mailroom;
use serde_json::{Map, Value};

use super::SUCCESS;

/// Accept one email for delivery
#[derive(Debug, Args)]
pub struct SendCommand {
    /// Recipient address
    #[arg(long)]
    to: String,

    /// Template name, e.g. `welcome` or `auth/reset-password`
    #[arg(short, long)]
    template: String,

    /// Subject line
    #[arg(short, long)]
    subject: Option<String>,

    /// Template variables as a JSON object
    #[arg(short, long, default_value = "{}")]
    props: String,

    /// Client the message is recorded against
    #[arg(long, default_value = "cli")]
    client_id: String,

    /// Correlation id
    #[arg(long)]
    trace_id: Option<String>,
}

impl SendCommand {
    /// Execute the send command
    ///
    /// # Errors
    ///
    /// Returns an error if the props are not a JSON object, the request is
    /// rejected, or the stores cannot be reached
    pub async fn execute(&self, config: MailroomConfig) -> Result<()> {
        let props = parse_props(&self.props)?;
        let mailroom = Mailroom::connect(config).await?;

        let accepted = mailroom
            .mail_service()
            .send(
                SendRequest {
                    to: self.to.clone(),
                    template: self.template.clone(),
                    subject: self.subject.clone(),
                    props,
                },
                SendMeta {
                    client_id: self.client_id.clone(),
                    trace_id: self.trace_id.clone(),
                },
            )
            .await?;

        println!(
            "{SUCCESS} Accepted message {}",
            style(accepted.message_id).cyan()
        );
        Ok(())
    }
}

fn parse_props(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(raw).context("--props is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--props must be a JSON object, got {other}"),
    }
}
