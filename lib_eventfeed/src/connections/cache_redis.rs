//! # Redis Cache Implementation
//!
//! Commands run over a lazily established `ConnectionManager`, which
//! reconnects on its own after transient failures. Subscriptions use a
//! dedicated pub/sub connection per call because a subscribed Redis
//! connection cannot issue regular commands.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::sync::Mutex;

use super::cache::{CacheError, NotificationStream, SnapshotCache};

/// A handler for Redis cache interactions.
pub struct RedisCache {
    /// The internal Redis client instance.
    client: Client,
    /// Shared command connection, created on first use.
    manager: Mutex<Option<ConnectionManager>>,
    closed: AtomicBool,
}

impl RedisCache {
    /// Creates a new RedisCache from a connection string.
    ///
    /// Only the URL is validated here; no connection is attempted until the
    /// first command, so a substrate that is still starting does not prevent
    /// the process from booting.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    pub fn new(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            manager: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        if let Some(conn) = self.manager.lock().await.as_ref() {
            return Ok(conn.clone());
        }

        // The lock is never held across the handshake.
        let conn = ConnectionManager::new(self.client.clone()).await?;

        let mut guard = self.manager.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        if guard.is_none() {
            tracing::info!("Redis command connection established");
        }
        // A concurrent caller may have won the race; keep its connection.
        Ok(guard.get_or_insert(conn).clone())
    }
}

#[async_trait]
impl SnapshotCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SET").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await?;
        tracing::debug!(channel, receivers, "Published change notification");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<NotificationStream, CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!("Dropping non-UTF-8 notification on {}: {}", msg.get_channel_name(), e);
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Dropping the manager closes its socket.
        self.manager.lock().await.take();
        tracing::info!("Redis connections closed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn rejects_malformed_url() {
        assert!(RedisCache::new("not a url").is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_commands() {
        let cache = RedisCache::new("redis://127.0.0.1:1/").unwrap();
        assert!(cache.close().await);
        assert!(!cache.close().await);
        assert!(matches!(cache.get("k").await, Err(CacheError::Closed)));
        assert!(matches!(cache.subscribe("c").await, Err(CacheError::Closed)));
    }

    #[tokio::test]
    async fn close_is_not_blocked_by_a_pending_connect() {
        // Accepts sockets and never answers, so the handshake hangs.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let cache = Arc::new(RedisCache::new(&format!("redis://{addr}/")).unwrap());
        let pending = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get("k").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let closed = tokio::time::timeout(Duration::from_secs(1), cache.close()).await;
        assert_eq!(closed.ok(), Some(true));
        assert!(matches!(cache.get("k").await, Err(CacheError::Closed)));

        pending.abort();
        server.abort();
    }
}
