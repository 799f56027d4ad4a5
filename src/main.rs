//! # adsync
//!
//! `serve` runs the API together with the scheduler and workers; `worker`
//! runs only the background half. The remaining subcommands are operator
//! utilities.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use adsync::{
    config::{AppConfig, ConfigLoader},
    db,
    server::{AppState, run_server},
    services::SyncServices,
    telemetry,
};

#[derive(Parser)]
#[command(name = "adsync")]
#[command(author, version, about = "Ad platform and storefront sync service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Skip running pending migrations at startup
    #[arg(long, global = true)]
    skip_migrations: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API, scheduler and worker pool (default)
    Serve,
    /// Run the scheduler and worker pool without the API
    Worker,
    /// Apply pending database migrations and exit
    Migrate,
    /// Print job counts per state
    QueueStatus,
    /// Delete every job; recurring schedules are kept
    PurgeQueue,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing tracing")?;
    info!(profile = %config.profile, "configuration loaded");
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "effective configuration");
    }

    let db = db::init_pool(&config).await?;
    let command = cli.command.unwrap_or(Commands::Serve);
    if matches!(command, Commands::Migrate) || !cli.skip_migrations {
        Migrator::up(&db, None).await.context("running migrations")?;
    }

    match command {
        Commands::Migrate => {
            info!("migrations applied");
            Ok(())
        }
        Commands::QueueStatus => {
            let services = SyncServices::build(&config, db)?;
            let status = services.queue.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::PurgeQueue => {
            let services = SyncServices::build(&config, db)?;
            let deleted = services.queue.purge().await?;
            println!("deleted {deleted} jobs");
            Ok(())
        }
        Commands::Worker => run(config, db, false).await,
        Commands::Serve => run(config, db, true).await,
    }
}

async fn run(config: AppConfig, db: sea_orm::DatabaseConnection, with_api: bool) -> Result<()> {
    let services = SyncServices::build(&config, db)?;
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for shutdown signal");
        }
        info!("shutdown requested");
        signal_token.cancel();
    });

    let handles = services.start_background(shutdown.clone()).await?;

    let served = if with_api {
        match config.bind_addr() {
            Ok(addr) => run_server(AppState::new(services), addr, shutdown.clone()).await,
            Err(err) => Err(err).context("parsing api bind address"),
        }
    } else {
        shutdown.cancelled().await;
        Ok(())
    };
    // A failed server still has to stop the background tasks.
    shutdown.cancel();

    for handle in handles {
        if let Err(err) = handle.await {
            warn!(error = %err, "background task ended abnormally");
        }
    }
    info!("shutdown complete");
    served
}
