//! Worker pool command

use anyhow::Result;
use clap::Args;
use console::style;
use mailroom::config::MailroomConfig;
use mailroom::jobs::ShutdownResult;
use mailroom::state::Mailroom;
use tracing::{info, warn};

use super::{INFO, SUCCESS};

/// Run the delivery worker pool
#[derive(Debug, Args)]
pub struct WorkerCommand {
    /// Override `worker.concurrency`
    #[arg(long)]
    concurrency: Option<usize>,

    /// Override `worker.rate_limit_per_second`
    #[arg(long)]
    rate: Option<u32>,

    /// Requeue jobs left in flight by a crashed worker before starting
    #[arg(long)]
    recover: bool,
}

impl WorkerCommand {
    /// Execute the worker command
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - logging cannot be initialised
    /// - Redis, Postgres or a provider cannot be set up
    pub async fn execute(&self, mut config: MailroomConfig) -> Result<()> {
        if let Some(concurrency) = self.concurrency {
            config.worker.concurrency = concurrency;
        }
        if let Some(rate) = self.rate {
            config.worker.rate_limit_per_second = rate;
        }
        mailroom::observability::init(&config.logging)?;

        let grace = config.worker.shutdown_grace();
        let mailroom = Mailroom::connect(config).await?;

        if self.recover {
            if let Some(broker) = mailroom.redis_broker() {
                let recovered = broker.recover_in_flight().await?;
                info!(recovered, "Requeued in-flight jobs");
            }
        }

        let pool = mailroom.spawn_workers();
        println!(
            "{INFO} Worker pool running ({} workers), press Ctrl-C to stop",
            style(mailroom.config().worker.concurrency).cyan()
        );

        shutdown_signal().await;
        info!(grace_secs = grace.as_secs(), "Shutdown requested");

        let stats = pool.stats();
        println!(
            "  settled so far: sent {} / skipped {} / retried {} / failed {}",
            style(stats.sent).green(),
            stats.skipped,
            style(stats.retried).yellow(),
            style(stats.failed).red()
        );

        match pool.shutdown(grace).await {
            ShutdownResult::Graceful => {
                println!("{SUCCESS} Worker pool stopped cleanly");
            }
            ShutdownResult::Forced { workers_remaining } => {
                warn!(workers_remaining, "Grace period elapsed, aborted workers");
                println!(
                    "{} Aborted {workers_remaining} workers after the grace period",
                    style("Warning:").yellow()
                );
            }
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
