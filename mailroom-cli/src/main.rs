//! mailroom CLI tool

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{EventCommand, QueueCommand, SendCommand, StatusCommand, TemplatesCommand, WorkerCommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mailroom")]
#[command(version)]
#[command(about = "Transactional email worker and operator tool", long_about = None)]
struct Cli {
    /// Configuration file used in place of ./mailroom.toml
    #[arg(short, long, global = true, env = "MAILROOM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the delivery worker pool until SIGINT/SIGTERM
    Worker(WorkerCommand),
    /// Accept one email for delivery
    Send(SendCommand),
    /// Show a message's delivery status
    Status(StatusCommand),
    /// Apply a provider webhook payload
    Event(EventCommand),
    /// Template artifact management
    Templates {
        #[command(subcommand)]
        command: TemplatesCommand,
    },
    /// Inspect the job queue
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Worker(cmd) => cmd.execute(config).await?,
        Commands::Send(cmd) => cmd.execute(config).await?,
        Commands::Status(cmd) => cmd.execute(config).await?,
        Commands::Event(cmd) => cmd.execute(config).await?,
        Commands::Templates { command } => command.execute(config).await?,
        Commands::Queue { command } => command.execute(config).await?,
    }

    Ok(())
}
