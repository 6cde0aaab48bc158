//! # Cache Substrate
//!
//! The external key-value and publish/subscribe service the pipeline is
//! coordinated through. Values are whole snapshot payloads; every write is a
//! single atomic `SET`, never a read-modify-write.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// Well-known key holding the latest snapshot payload.
pub const SNAPSHOT_KEY: &str = "events_snapshot";

/// Well-known channel carrying change notifications.
pub const UPDATES_CHANNEL: &str = "updates";

/// Messages received on a subscribed channel. The stream ends when the
/// underlying subscription is lost.
pub type NotificationStream = BoxStream<'static, String>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis command failed")]
    Redis(#[from] redis::RedisError),
    #[error("Cache unavailable: {0}")]
    Unavailable(String),
    #[error("Cache connection is closed")]
    Closed,
}

#[async_trait]
pub trait SnapshotCache: Send + Sync + 'static {
    /// Reads a value; `None` when the key has never been written.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Replaces the value under `key` in one atomic operation.
    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;

    /// Fire-and-forget publish; zero subscribers is not an error.
    async fn publish(&self, channel: &str, message: &str) -> Result<(), CacheError>;

    /// Opens a dedicated subscription to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<NotificationStream, CacheError>;

    /// Releases connections. Returns `true` only for the call that actually
    /// closed the cache; later calls are no-ops.
    async fn close(&self) -> bool;
}
