//! # Process Lifecycle
//!
//! Signal handling plus the ordered, idempotent shutdown shared by both
//! processes: stop timers and subscriptions, close client connections, then
//! release the source-of-truth pool and the cache connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::connections::cache::SnapshotCache;
use crate::connections::db_postgres::EventSource;
use crate::core::registry::ConnectionRegistry;

/// Completes on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

/// What one [`Shutdown::run`] call actually released.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub timers_stopped: bool,
    pub connections_closed: usize,
    pub source_closed: bool,
    pub cache_closed: bool,
}

/// The resources a process owns, released in order.
pub struct Shutdown {
    token: CancellationToken,
    registry: Option<Arc<ConnectionRegistry>>,
    source: Option<Arc<dyn EventSource>>,
    cache: Option<Arc<dyn SnapshotCache>>,
    started: AtomicBool,
}

impl Shutdown {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            registry: None,
            source: None,
            cache: None,
            started: AtomicBool::new(false),
        }
    }

    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn SnapshotCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Token watched by every timer and subscription loop.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Releases everything. Safe to call any number of times and from any
    /// task; each resource is closed by exactly one call.
    pub async fn run(&self) -> ShutdownReport {
        let first = !self.started.swap(true, Ordering::AcqRel);
        if first {
            tracing::info!("Shutting down");
        }

        let mut report = ShutdownReport {
            timers_stopped: !self.token.is_cancelled(),
            ..ShutdownReport::default()
        };
        self.token.cancel();

        if let Some(registry) = &self.registry {
            report.connections_closed = registry.close_all();
        }
        if let Some(source) = &self.source {
            report.source_closed = source.close().await;
        }
        if let Some(cache) = &self.cache {
            report.cache_closed = cache.close().await;
        }

        if first {
            tracing::info!(
                connections = report.connections_closed,
                source = report.source_closed,
                cache = report.cache_closed,
                "Shutdown complete"
            );
        }
        report
    }
}
