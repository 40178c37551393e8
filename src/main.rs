//! medialink daemon entry point
//!
//! Load config, check the roots and the audit store, then run the ingest and
//! watcher services until Ctrl-C or SIGTERM, logging their health on an
//! interval.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

use medialink::cli::{CliOptions, USAGE};
use medialink::config::Config;
use medialink::db::Database;
use medialink::error::IngestError;
use medialink::services::{IngestService, ServicesManager, WatcherService, init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    let options = CliOptions::from_args();
    if options.help {
        println!("{}", USAGE);
        return Ok(());
    }

    match &options.config_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let mut config = Config::from_env()?;
    options.apply(&mut config);
    init_tracing(config.log_format)?;

    info!(
        watch = %config.watch_folder.display(),
        tv = %config.tv_root().display(),
        movies = %config.movie_root().display(),
        mode = ?config.watch_mode,
        workers = config.workers,
        dry_run = config.dry_run,
        "Starting medialink"
    );

    config.validate_roots()?;

    let db = Database::connect(&config.database_url())
        .await
        .map_err(|e| IngestError::FatalIo(format!("audit store unreachable: {:#}", e)))?;

    let audit = db.processed_media();
    let placed = audit.count().await.context("Failed to read audit store")?;
    let last = audit
        .list_recent(1)
        .await
        .context("Failed to read audit store")?
        .into_iter()
        .next()
        .map(|record| record.destination_path);
    info!(placed, last = last.as_deref().unwrap_or("-"), "Audit store ready");

    let ingest = Arc::new(IngestService::from_config(&config, Arc::new(db.clone())));
    let watcher = Arc::new(WatcherService::new(&config, ingest.dispatcher()));

    let manager = ServicesManager::builder()
        .add_service(ingest)
        .add_service(watcher)
        .start()
        .await?;

    let period = config.health_check_interval;
    let mut health = tokio::time::interval_at(Instant::now() + period, period);
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            _ = health.tick() => {
                manager.report_health().await;
            }
        }
    }
    info!("Shutting down");

    manager.stop_all().await?;
    db.close().await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C"),
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}
