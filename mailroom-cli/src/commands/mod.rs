//! CLI command implementations

pub mod event;
pub mod queue;
pub mod send;
pub mod status;
pub mod templates;
pub mod worker;

pub use event::EventCommand;
pub use queue::QueueCommand;
pub use send::SendCommand;
pub use status::StatusCommand;
pub use templates::TemplatesCommand;
pub use worker::WorkerCommand;

use anyhow::{Context, Result};
use console::Emoji;
use mailroom::config::MailroomConfig;
use std::path::Path;

pub static SUCCESS: Emoji = Emoji("✓", "√");
pub static INFO: Emoji = Emoji("ℹ", "i");
pub static FAILURE: Emoji = Emoji("✗", "x");

/// Load configuration, honouring an explicit file
pub fn load_config(path: Option<&Path>) -> Result<MailroomConfig> {
    match path {
        Some(path) => MailroomConfig::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => MailroomConfig::load().context("Failed to load configuration"),
    }
}
