use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cpalert_sync::{maybe_build_scheduler, AlertConfig, AlertService};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cpalert")]
#[command(about = "Upcoming programming contests and reminders")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch and print upcoming contests once.
    Refresh {
        /// Look-ahead in days for every platform, overriding the registry.
        #[arg(long)]
        days: Option<u32>,
    },
    /// Check which sources are reachable.
    Probe,
    /// Refresh, arm reminders and serve until interrupted.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AlertConfig::from_env().context("loading configuration")?;
    let service = Arc::new(AlertService::from_config(&config)?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Refresh { days } => {
            let contests = service.refresh_with_days(days).await;
            if contests.is_empty() {
                println!("{}", cpalert_web::NO_CONTESTS_MESSAGE);
            }
            for contest in &contests {
                println!(
                    "{}  {:<10}  {}  {}",
                    contest.start_time().format("%Y-%m-%d %H:%M UTC"),
                    contest.platform().display_name(),
                    contest.name(),
                    contest.url()
                );
            }
        }
        Commands::Probe => {
            for probe in service.probe_all().await {
                println!(
                    "{}: {}",
                    probe.platform,
                    if probe.reachable { "reachable" } else { "unreachable" }
                );
                for adapter in probe.adapters {
                    println!("  {:<18} {:?}", adapter.source_id, adapter.status);
                }
            }
        }
        Commands::Run => {
            let summary = service.refresh_and_arm().await;
            info!(
                contests = summary.contests,
                armed = summary.reminders.armed,
                "initial refresh finished"
            );

            let scheduler = maybe_build_scheduler(Arc::clone(&service), &config).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting refresh scheduler")?;
                info!(cron = %config.refresh_cron, "refresh scheduler started");
            }

            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            cpalert_web::serve(&config.bind_addr, Arc::clone(&service), shutdown).await?;

            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping refresh scheduler")?;
            }
            let cancelled = service.shutdown().await;
            info!(cancelled, "reminders cancelled; exiting");
        }
    }

    Ok(())
}
