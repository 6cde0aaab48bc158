//! # Snapshot Server
//!
//! WebSocket fan-out for the Redis snapshot. New clients receive the current
//! snapshot on connect; every notification on the `updates` channel pushes
//! the fresh snapshot to all connected clients. Unresponsive clients are
//! dropped by the heartbeat sweep.

use std::net::SocketAddr;
use std::sync::Arc;

use lib_eventfeed::configs::config_sys::load_settings;
use lib_eventfeed::connections::cache_redis::RedisCache;
use lib_eventfeed::core::bridge::NotificationBridge;
use lib_eventfeed::core::fanout::FanoutServer;
use lib_eventfeed::core::lifecycle::{shutdown_signal, Shutdown};
use lib_eventfeed::core::registry::ConnectionRegistry;
use lib_eventfeed::loggers::loggerlocal::setup_logging;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- Phase 1: Configuration & Logging ---
    let settings = load_settings()?;
    let _guards = setup_logging(&settings.logger_options())?;
    info!(env = ?settings.app_env, "Snapshot server starting");

    // --- Phase 2: Core Infrastructure ---
    let cache = Arc::new(RedisCache::new(&settings.redis_url)?);
    let registry = Arc::new(ConnectionRegistry::new());
    let shutdown = Shutdown::new(CancellationToken::new())
        .with_registry(registry.clone())
        .with_cache(cache.clone());

    let bridge = NotificationBridge::new(cache.clone(), registry.clone(), settings.subscribe_retry);
    let server = FanoutServer::new(cache, registry, settings.heartbeat_interval);

    // --- Phase 3: Listener ---
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server is running on port {}", settings.port);

    // --- Phase 4: Background Tasks ---
    // The bridge starts after the listener is bound.
    let server_task = tokio::spawn({
        let token = shutdown.token();
        async move { server.run(listener, token).await }
    });
    let bridge_task = tokio::spawn({
        let token = shutdown.token();
        async move { bridge.run(token).await }
    });

    // --- Phase 5: Shutdown ---
    shutdown_signal().await;
    shutdown.run().await;
    let (served, bridged) = tokio::join!(server_task, bridge_task);
    bridged?;
    served??;
    info!("Snapshot server stopped");
    Ok(())
}
