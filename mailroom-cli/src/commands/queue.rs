//! Job queue inspection commands

use anyhow::Result;
use clap::Subcommand;
use console::style;
use mailroom::config::MailroomConfig;
use mailroom::state::Mailroom;

use super::{INFO, SUCCESS};

/// Job queue commands
#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// Show queue depths
    Stats,

    /// List dead-lettered jobs
    DeadLetters {
        /// Limit number of results
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Requeue jobs left in flight by a crashed worker
    ///
    /// Only safe while no worker is running.
    Recover,
}

impl QueueCommand {
    /// Execute the queue command
    ///
    /// # Errors
    ///
    /// Returns an error if Redis or Postgres cannot be reached
    pub async fn execute(&self, config: MailroomConfig) -> Result<()> {
        let mailroom = Mailroom::connect(config).await?;
        match self {
            Self::Stats => {
                let depths = mailroom.broker().depths().await?;
                println!("{}", style("Queue Status").bold().underlined());
                println!("  Pending:   {}", style(depths.pending).blue());
                println!("  Delayed:   {}", style(depths.delayed).yellow());
                println!("  In flight: {}", style(depths.in_flight).cyan());
                println!("  Dead:      {}", style(depths.dead).red());
            }
            Self::DeadLetters { limit } => {
                let Some(broker) = mailroom.redis_broker() else {
                    return Ok(());
                };
                let dead = broker.dead_letters(*limit).await?;
                if dead.is_empty() {
                    println!("  {}", style("(No dead-lettered jobs)").dim());
                    return Ok(());
                }

                println!(
                    "{:<38} {:<38} {:<8} {:<26} Error",
                    "Job", "Message", "Attempts", "Dead at"
                );
                println!("{}", "─".repeat(120));
                for letter in dead {
                    println!(
                        "{:<38} {:<38} {:<8} {:<26} {}",
                        letter.id,
                        letter.job.message_id,
                        letter.attempts,
                        letter.dead_at.to_rfc3339(),
                        style(letter.error).red()
                    );
                }
            }
            Self::Recover => {
                if let Some(broker) = mailroom.redis_broker() {
                    let recovered = broker.recover_in_flight().await?;
                    println!("{SUCCESS} Requeued {recovered} in-flight jobs");
                } else {
                    println!("{INFO} Nothing to recover");
                }
            }
        }
        Ok(())
    }
}
