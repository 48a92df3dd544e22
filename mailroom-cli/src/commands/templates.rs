//! Template artifact commands

use anyhow::{Context, Result};
use clap::Subcommand;
use console::style;
use mailroom::config::MailroomConfig;
use mailroom::lock::{DistributedLock, InMemoryLockBackend, LockBackend, RedisLockBackend};
use mailroom::template::TemplateEngine;
use std::sync::Arc;

use super::{FAILURE, INFO, SUCCESS};

/// Template artifact management
#[derive(Debug, Subcommand)]
pub enum TemplatesCommand {
    /// List template sources
    List,

    /// Compile every template (or the named ones) ahead of the first send
    Build {
        /// Templates to build; all discovered templates when empty
        names: Vec<String>,

        /// Coordinate with an in-process lock instead of Redis
        #[arg(long)]
        local: bool,
    },
}

impl TemplatesCommand {
    /// Execute the templates command
    ///
    /// # Errors
    ///
    /// Returns an error if the source directory cannot be listed, Redis is
    /// unreachable, or any template fails to build
    pub async fn execute(&self, config: MailroomConfig) -> Result<()> {
        match self {
            Self::List => list(&config).await,
            Self::Build { names, local } => build(&config, names, *local).await,
        }
    }
}

fn engine(config: &MailroomConfig, local: bool) -> Result<TemplateEngine> {
    let backend: Arc<dyn LockBackend> = if local {
        Arc::new(InMemoryLockBackend::new())
    } else {
        let pool = deadpool_redis::Config::from_url(config.redis.url.clone())
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .context("Failed to create Redis pool")?;
        Arc::new(RedisLockBackend::new(pool))
    };
    let lock = DistributedLock::with_settings(backend, &config.lock);
    Ok(TemplateEngine::from_settings(&config.templates, lock))
}

async fn list(config: &MailroomConfig) -> Result<()> {
    let engine = engine(config, true)?;
    let layout = engine.cache().layout();
    let names = layout.discover().await?;

    println!("{INFO} {} templates", style(names.len()).cyan());
    for name in names {
        println!("  {name:<32} {}", style(layout.source_path(&name).display()).dim());
    }
    Ok(())
}

async fn build(config: &MailroomConfig, names: &[String], local: bool) -> Result<()> {
    let engine = engine(config, local)?;
    let names = if names.is_empty() {
        engine.cache().layout().discover().await?
    } else {
        names.to_vec()
    };

    let mut failed = 0_usize;
    for name in &names {
        match engine.cache().resolve(name).await {
            Ok(handle) => println!(
                "{SUCCESS} {name:<32} {}",
                style(handle.path().display()).dim()
            ),
            Err(err) => {
                failed += 1;
                println!("{FAILURE} {name:<32} {}", style(err).red());
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} templates failed to build", names.len());
    }
    Ok(())
}
