//! Shared harness for the end-to-end tests: an in-process fan-out server on
//! an ephemeral port backed by the in-memory cache, plus a scripted event
//! source.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use lib_eventfeed::connections::cache_memory::MemoryCache;
use lib_eventfeed::connections::db_postgres::{Event, EventSource, SourceError};
use lib_eventfeed::core::fanout::FanoutServer;
use lib_eventfeed::core::registry::ConnectionRegistry;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub cache: Arc<MemoryCache>,
    pub registry: Arc<ConnectionRegistry>,
    pub shutdown: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    /// Binds 127.0.0.1 on a free port and serves until [`TestServer::stop`].
    pub async fn start(cache: Arc<MemoryCache>, heartbeat: Duration) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("Listener has no address");
        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = CancellationToken::new();

        let server = FanoutServer::new(cache.clone(), registry.clone(), heartbeat);
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { server.run(listener, shutdown).await }
        });

        TestServer {
            addr,
            cache,
            registry,
            shutdown,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Connects a client and waits until the server has registered it.
    pub async fn connect(&self, path: &str) -> Client {
        let before = self.registry.len();
        let (client, _) = connect_async(self.url(path))
            .await
            .expect("WebSocket handshake failed");
        self.wait_for_connections(before + 1).await;
        client
    }

    pub async fn wait_for_connections(&self, expected: usize) {
        let registry = self.registry.clone();
        tokio::time::timeout(STEP_TIMEOUT, async move {
            while registry.len() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("Registry never reached {} connections", expected));
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let served = tokio::time::timeout(STEP_TIMEOUT, self.task)
            .await
            .expect("Server did not stop in time")
            .expect("Server task panicked");
        served.expect("Server returned an error");
    }
}

/// Next text frame, skipping control frames.
pub async fn next_text(client: &mut Client) -> String {
    tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return text.as_str().to_string(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("Expected a text frame, got {:?}", other),
            }
        }
    })
    .await
    .expect("Timed out waiting for a text frame")
}

/// `true` if no text frame arrives within `window`.
pub async fn stays_quiet(client: &mut Client, window: Duration) -> bool {
    let waited = tokio::time::timeout(window, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(_))) => return,
                Some(Ok(_)) => continue,
                _ => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    waited.is_err()
}

pub fn event(id: i64) -> Event {
    let created_at = Utc
        .timestamp_opt(1_700_000_000 + id, 0)
        .single()
        .expect("valid timestamp");
    let body = serde_json::json!({
        "id": id,
        "name": "Transfer",
        "signature": "Transfer(address,address,uint256)",
        "hash": format!("0xhash{}", id),
        "data": { "value": id.to_string() },
        "block_number": 1_000 + id,
        "transaction_hash": format!("0xtx{}", id),
        "log_index": 0,
        "raw_data": null,
        "address": "0x0000000000000000000000000000000000000001",
        "tracker_name": "erc20",
        "created_at": created_at.to_rfc3339(),
    });
    Event::from_row_json(id, body).expect("event row is an object")
}

/// Event source returning a fixed table, newest first, honouring the limit.
pub struct FixedSource {
    table: Vec<Event>,
}

impl FixedSource {
    pub fn with_ids(ids: std::ops::RangeInclusive<i64>) -> Self {
        FixedSource {
            table: ids.rev().map(event).collect(),
        }
    }
}

#[async_trait]
impl EventSource for FixedSource {
    async fn fetch_recent(&self, limit: i64) -> Result<Vec<Event>, SourceError> {
        Ok(self.table.iter().take(limit as usize).cloned().collect())
    }

    async fn close(&self) -> bool {
        true
    }
}
