use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use lib_eventfeed::connections::cache::{SnapshotCache, SNAPSHOT_KEY};
use lib_eventfeed::connections::cache_memory::MemoryCache;
use project_tests::{next_text, stays_quiet, TestServer, STEP_TIMEOUT};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const HEARTBEAT: Duration = Duration::from_secs(30);

#[tokio::test]
async fn new_client_receives_cached_snapshot_first() {
    let cache = Arc::new(MemoryCache::new());
    cache.set(SNAPSHOT_KEY, r#"[{"id":105},{"id":104}]"#).await.unwrap();
    let server = TestServer::start(cache, HEARTBEAT).await;

    let mut client = server.connect("/").await;
    assert_eq!(next_text(&mut client).await, r#"[{"id":105},{"id":104}]"#);

    server.stop().await;
}

#[tokio::test]
async fn empty_cache_sends_nothing_on_connect() {
    let server = TestServer::start(Arc::new(MemoryCache::new()), HEARTBEAT).await;

    let mut client = server.connect("/ws").await;
    assert!(stays_quiet(&mut client, Duration::from_millis(200)).await);

    server.registry.broadcast(Arc::from("[]"));
    assert_eq!(next_text(&mut client).await, "[]");

    server.stop().await;
}

#[tokio::test]
async fn unreadable_cache_sends_nothing_and_keeps_the_client() {
    let cache = Arc::new(MemoryCache::new());
    cache.set_available(false);
    let server = TestServer::start(cache, HEARTBEAT).await;

    let mut client = server.connect("/").await;
    assert!(stays_quiet(&mut client, Duration::from_millis(200)).await);
    assert_eq!(server.registry.len(), 1);

    server.registry.broadcast(Arc::from("[9]"));
    assert_eq!(next_text(&mut client).await, "[9]");

    server.stop().await;
}

#[tokio::test]
async fn broadcast_reaches_every_client_and_skips_departed_ones() {
    let server = TestServer::start(Arc::new(MemoryCache::new()), HEARTBEAT).await;

    let mut first = server.connect("/").await;
    let mut second = server.connect("/ws").await;
    let report = server.registry.broadcast(Arc::from("[1]"));
    assert_eq!(report.delivered, 2);
    assert_eq!(next_text(&mut first).await, "[1]");
    assert_eq!(next_text(&mut second).await, "[1]");

    second.close(None).await.unwrap();
    server.wait_for_connections(1).await;

    server.registry.broadcast(Arc::from("[2]"));
    assert_eq!(next_text(&mut first).await, "[2]");

    server.stop().await;
}

#[tokio::test]
async fn client_messages_are_ignored() {
    let cache = Arc::new(MemoryCache::new());
    cache.set(SNAPSHOT_KEY, "[]").await.unwrap();
    let server = TestServer::start(cache, HEARTBEAT).await;

    let mut client = server.connect("/").await;
    assert_eq!(next_text(&mut client).await, "[]");
    client.send("hello".into()).await.unwrap();
    assert!(stays_quiet(&mut client, Duration::from_millis(200)).await);
    assert_eq!(server.registry.len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn silent_client_is_evicted_and_responsive_one_kept() {
    let heartbeat = Duration::from_millis(100);
    let server = TestServer::start(Arc::new(MemoryCache::new()), heartbeat).await;

    // Never polled, so pings are never answered.
    let _silent = server.connect("/").await;

    // Polling lets the client answer pings automatically.
    let responsive = server.connect("/").await;
    let (_sink, mut stream) = responsive.split();
    let reader = tokio::spawn(async move { while let Some(Ok(_)) = stream.next().await {} });

    tokio::time::sleep(heartbeat * 6).await;
    assert_eq!(server.registry.len(), 1);

    server.stop().await;
    reader.abort();
}

#[tokio::test]
async fn shutdown_closes_clients() {
    let server = TestServer::start(Arc::new(MemoryCache::new()), HEARTBEAT).await;
    let mut client = server.connect("/").await;

    server.stop().await;

    let closed = tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            match client.next().await {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None | Some(Err(_)) => {
                    break
                }
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

#[tokio::test]
async fn health_reports_connection_count() {
    let server = TestServer::start(Arc::new(MemoryCache::new()), HEARTBEAT).await;
    let _client = server.connect("/").await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    tokio::time::timeout(STEP_TIMEOUT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["connections"], 1);

    server.stop().await;
}
