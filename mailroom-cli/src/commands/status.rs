//! Status command

use anyhow::{Context, Result};
use clap::Args;
use console::{style, StyledObject};
use mailroom::config::MailroomConfig;
use mailroom::lifecycle::{MessageId, MessageStatus};
use mailroom::state::Mailroom;

use super::FAILURE;

/// Show a message's delivery status
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Message ID returned when the message was accepted
    message_id: String,

    /// Print the record as JSON
    #[arg(long)]
    json: bool,
}

impl StatusCommand {
    /// Execute the status command
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is malformed or the store cannot be reached
    pub async fn execute(&self, config: MailroomConfig) -> Result<()> {
        let id: MessageId = self
            .message_id
            .parse()
            .with_context(|| format!("'{}' is not a message ID", self.message_id))?;
        let mailroom = Mailroom::connect(config).await?;

        let Some(message) = mailroom.store().get(id).await? else {
            println!("{FAILURE} No message {}", style(id).cyan());
            return Ok(());
        };

        if self.json {
            println!("{}", serde_json::to_string_pretty(&message)?);
            return Ok(());
        }

        println!("{}", style(format!("Message {}", message.id)).bold());
        println!("  Status:      {}", colored(message.status));
        println!("  Recipient:   {}", message.recipient);
        println!("  Template:    {}", message.template_name);
        println!("  Attempts:    {}", message.attempts);
        if let Some(provider) = &message.provider {
            println!("  Provider:    {provider}");
        }
        if let Some(provider_msg_id) = &message.provider_msg_id {
            println!("  Provider ID: {provider_msg_id}");
        }
        if let Some(sent_at) = message.sent_at {
            println!("  Sent at:     {sent_at}");
        }
        if let Some(error) = &message.error_message {
            println!("  Error:       {}", style(error).red());
        }
        println!("  Updated:     {}", message.updated_at);
        Ok(())
    }
}

fn colored(status: MessageStatus) -> StyledObject<MessageStatus> {
    match status {
        MessageStatus::Queued | MessageStatus::Processing => style(status).yellow(),
        MessageStatus::Sent | MessageStatus::Delivered => style(status).green(),
        MessageStatus::Failed | MessageStatus::Bounced => style(status).red(),
    }
}
