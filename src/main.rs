//! # Metrics Refresher Entry Point
//!
//! `serve` (default) runs migrations, the scheduler and the status server;
//! `tick` runs a single pass and prints its summary; `migrate` only applies
//! migrations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;

use metrics_refresher::{
    config::{AppConfig, ConfigLoader},
    db::init_pool,
    lookup::XLookupClient,
    migration::{Migrator, MigratorTrait},
    scheduler::{MetricsScheduler, SystemClock},
    server::{AppState, run_server},
    telemetry::init_tracing,
    token_refresh::{TokenRefresher, XTokenRefresher},
};

#[derive(Debug, Parser)]
#[command(name = "metrics-refresher", version, about = "Post metrics refresh scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Run migrations, the background scheduler and the status server
    Serve,
    /// Run exactly one refresh tick and print its summary as JSON
    Tick,
    /// Apply pending database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load()?;
    init_tracing(&config)?;

    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let db = init_pool(&config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => {
            Migrator::up(&db, None)
                .await
                .context("failed to apply migrations")?;
            tracing::info!("Migrations applied");
        }
        Command::Tick => {
            let scheduler = build_scheduler(&config, db)?;
            if let Some(summary) = scheduler.run_tick().await {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
        Command::Serve => {
            Migrator::up(&db, None)
                .await
                .context("failed to apply migrations")?;
            serve(config, db).await?;
        }
    }

    Ok(())
}

async fn serve(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let scheduler = build_scheduler(&config, db.clone())?;
    scheduler.start();

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    let state = AppState {
        config: Arc::new(config),
        db,
        scheduler: scheduler.clone(),
    };
    let served = run_server(state, shutdown.clone()).await;

    shutdown.cancel();
    scheduler.stop().await;
    served
}

fn build_scheduler(config: &AppConfig, db: DatabaseConnection) -> anyhow::Result<MetricsScheduler> {
    let timeout = Duration::from_millis(config.lookup_timeout_ms);
    let lookup = XLookupClient::new(config.x_api_base.clone(), timeout)?;

    let refresher: Option<Arc<dyn TokenRefresher>> = match &config.x_client_id {
        Some(client_id) => Some(Arc::new(XTokenRefresher::new(
            config.x_token_url.clone(),
            client_id.clone(),
            config.x_client_secret.clone(),
            timeout,
        )?)),
        None => {
            tracing::warn!("METRICS_X_CLIENT_ID not set; expired tokens cannot be refreshed");
            None
        }
    };

    Ok(MetricsScheduler::new(
        db,
        config.scheduler.clone(),
        Arc::new(lookup),
        refresher,
        Arc::new(SystemClock),
    ))
}
