//! # WebSocket Fan-out Server
//!
//! Accepts client WebSocket connections on `/` and `/ws`, sends each new
//! client the cached snapshot, and relays whatever the notification bridge
//! broadcasts through the [`ConnectionRegistry`]. `/health` reports the
//! number of registered connections.
//!
//! Every connection runs two halves:
//!
//! - a writer task draining the connection's outbound queue into the socket,
//! - the reader loop, which records ping responses and watches for close.
//!
//! Anything else a client sends is ignored.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::connections::cache::{SnapshotCache, SNAPSHOT_KEY};
use crate::core::registry::{ConnectionHandle, ConnectionRegistry, Outbound};
use crate::loggers::loggerlocal::error_chain;

/// How long a finished connection waits for its writer to flush a close frame.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state for the router's handlers.
pub struct FanoutState<C> {
    cache: Arc<C>,
    registry: Arc<ConnectionRegistry>,
}

impl<C> Clone for FanoutState<C> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            registry: Arc::clone(&self.registry),
        }
    }
}

pub struct FanoutServer<C> {
    state: FanoutState<C>,
    heartbeat_interval: Duration,
}

impl<C: SnapshotCache> FanoutServer<C> {
    pub fn new(cache: Arc<C>, registry: Arc<ConnectionRegistry>, heartbeat_interval: Duration) -> Self {
        Self {
            state: FanoutState { cache, registry },
            heartbeat_interval,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.registry
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(ws_handler::<C>))
            .route("/ws", get(ws_handler::<C>))
            .route("/health", get(health_handler::<C>))
            .with_state(self.state.clone())
    }

    /// Serves on `listener` and runs the liveness sweeper until `shutdown`
    /// fires. All client connections are closed on the way out.
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
        let addr: Option<SocketAddr> = listener.local_addr().ok();
        tracing::info!("WebSocket server listening on {:?}", addr);

        let sweeper = tokio::spawn({
            let registry = Arc::clone(&self.state.registry);
            let shutdown = shutdown.clone();
            let interval = self.heartbeat_interval;
            async move { registry.run_sweeper(interval, shutdown).await }
        });

        let registry = Arc::clone(&self.state.registry);
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                registry.close_all();
                tracing::info!("WebSocket server shutting down");
            })
            .await;

        sweeper.abort();
        let _ = sweeper.await;
        served
    }
}

async fn ws_handler<C: SnapshotCache>(
    ws: WebSocketUpgrade,
    State(state): State<FanoutState<C>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn health_handler<C: SnapshotCache>(State(state): State<FanoutState<C>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.registry.len(),
    }))
}

/// Sends the cached snapshot, if there is one, as the connection's first
/// frame. Failures only cost this client its initial snapshot.
async fn queue_initial_snapshot<C: SnapshotCache>(state: &FanoutState<C>, id: u64) {
    match state.cache.get(SNAPSHOT_KEY).await {
        Ok(Some(payload)) => {
            state.registry.send_to(id, Outbound::Snapshot(Arc::from(payload)));
        }
        Ok(None) => tracing::debug!("No snapshot cached yet for connection {}", id),
        Err(e) => tracing::error!(
            error = %error_chain(&e),
            "Error fetching snapshot from Redis for connection {}", id
        ),
    }
}

async fn handle_socket<C: SnapshotCache>(mut socket: WebSocket, state: FanoutState<C>) {
    let Some(handle) = state.registry.register() else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    let ConnectionHandle {
        id,
        mut outbound,
        cancel,
    } = handle;
    tracing::info!("New WebSocket connection {}", id);

    queue_initial_snapshot(&state, id).await;

    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let message = match frame {
                Outbound::Snapshot(payload) => Message::Text(payload.to_string().into()),
                Outbound::Ping => Message::Ping(Bytes::new()),
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = sink.send(message).await {
                // Later frames are skipped; the sweep or the reader cleans up.
                tracing::debug!("Write to connection {} failed: {}", id, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Pong(_))) => state.registry.mark_alive(id),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Read from connection {} failed: {}", id, e);
                    break;
                }
            },
        }
    }

    state.registry.remove(id);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    tracing::info!("WebSocket connection {} closed", id);
}
