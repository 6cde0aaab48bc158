//! # Snapshot Updater
//!
//! Polls PostgreSQL for the most recent events on a fixed interval, writes
//! them to Redis as one JSON snapshot and announces each write on the
//! `updates` channel. Runs until SIGINT or SIGTERM.

use std::sync::Arc;

use lib_eventfeed::configs::config_sys::load_settings;
use lib_eventfeed::connections::cache_redis::RedisCache;
use lib_eventfeed::connections::db_postgres::PostgresSource;
use lib_eventfeed::core::lifecycle::{shutdown_signal, Shutdown};
use lib_eventfeed::core::refresher::SnapshotRefresher;
use lib_eventfeed::loggers::loggerlocal::setup_logging;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- Phase 1: Configuration & Logging ---
    let settings = load_settings()?;
    let _guards = setup_logging(&settings.logger_options())?;
    info!(env = ?settings.app_env, "Snapshot updater starting");

    // --- Phase 2: Connections ---
    // Neither constructor connects; the first refresh cycle does.
    let postgres_url = settings.require_postgres_url()?;
    let source = Arc::new(PostgresSource::new(postgres_url, settings.pg_pool_size)?);
    let cache = Arc::new(RedisCache::new(&settings.redis_url)?);

    let shutdown = Shutdown::new(CancellationToken::new())
        .with_source(source.clone())
        .with_cache(cache.clone());

    // --- Phase 3: Refresh Loop ---
    let refresher = SnapshotRefresher::new(source, cache, settings.update_interval);
    let token = shutdown.token();
    let worker = tokio::spawn(async move { refresher.run(token).await });
    info!("PostgreSQL to Redis updater is running");

    // --- Phase 4: Shutdown ---
    shutdown_signal().await;
    shutdown.run().await;
    worker.await?;
    info!("Snapshot updater stopped");
    Ok(())
}
