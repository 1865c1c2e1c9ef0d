use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hsync_storage::{ListingStore, PgListingStore};
use hsync_sync::{
    build_scheduler, RunMode, SourceRegistry, SyncConfig, SyncError, SyncPipeline,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "hsync")]
#[command(about = "Scrape hackathon listings and sync them into the listing store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once.
    Sync {
        /// Reconcile and report without writing to the store.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply pending store migrations.
    Migrate,
    /// Run on HSYNC_SYNC_CRON until Ctrl-C.
    Schedule,
    /// Print stored listing counts by status.
    Count,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hsync_sync=debug,hsync_adapters=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Commands::Sync { dry_run: false })).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = SyncConfig::from_env()?;
    let store = PgListingStore::connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")?;

    match command {
        Commands::Sync { dry_run } => {
            let pipeline = pipeline(&config, store).await?;
            let mode = if dry_run { RunMode::DryRun } else { RunMode::Apply };
            match pipeline.run(mode).await {
                Ok(result) => {
                    println!(
                        "sync complete: run_id={} new={} changed={} reactivated={} unchanged={} stale={} failed={} source_errors={} dry_run={}",
                        result.run_id,
                        result.new,
                        result.changed,
                        result.reactivated,
                        result.unchanged,
                        result.stale,
                        result.failed,
                        result.source_errors.len(),
                        result.dry_run
                    );
                    for source_error in &result.source_errors {
                        println!("  {source_error}");
                    }
                }
                Err(SyncError::LeaseHeld { name }) => {
                    info!(lease = %name, "another sync run is in progress; nothing to do");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Commands::Migrate => {
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let cron = config
                .sync_cron
                .clone()
                .context("HSYNC_SYNC_CRON must be set to use schedule")?;
            let pipeline = Arc::new(pipeline(&config, store).await?);
            let mut sched = build_scheduler(pipeline, &cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Count => {
            let counts = store.count_by_status().await?;
            println!(
                "listings: {} (active {}, stale {})",
                counts.total(),
                counts.active,
                counts.stale
            );
        }
    }

    Ok(())
}

async fn pipeline(config: &SyncConfig, store: PgListingStore) -> Result<SyncPipeline> {
    let registry = SourceRegistry::load(&config.sources_file)?;
    let pipeline = SyncPipeline::from_registry(config, &registry, Arc::new(store)).await?;
    Ok(pipeline)
}
