//! # In-Memory Cache
//!
//! A process-local stand-in for Redis. Pub/sub rides on a
//! `tokio::sync::broadcast` channel; like Redis, messages published while
//! nobody is subscribed are lost.
//!
//! Outages can be simulated with [`MemoryCache::set_available`], failed
//! subscription attempts with [`MemoryCache::fail_next_subscribes`], and a
//! silently dropped subscription with [`MemoryCache::drop_subscriptions`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::broadcast::{self, error::RecvError};

use super::cache::{CacheError, NotificationStream, SnapshotCache};

const BUS_CAPACITY: usize = 256;

pub struct MemoryCache {
    entries: RwLock<HashMap<String, String>>,
    bus: Mutex<broadcast::Sender<(String, String)>>,
    available: AtomicBool,
    failing_subscribes: AtomicUsize,
    failing_publishes: AtomicUsize,
    closed: AtomicBool,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            bus: Mutex::new(bus),
            available: AtomicBool::new(true),
            failing_subscribes: AtomicUsize::new(0),
            failing_publishes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// While unavailable every operation fails, as if the server were down.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// The next `count` calls to `subscribe` fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.failing_subscribes.store(count, Ordering::Release);
    }

    /// The next `count` calls to `publish` fail while reads and writes keep
    /// working.
    pub fn fail_next_publishes(&self, count: usize) {
        self.failing_publishes.store(count, Ordering::Release);
    }

    /// Ends every open subscription stream.
    pub fn drop_subscriptions(&self) {
        let (fresh, _) = broadcast::channel(BUS_CAPACITY);
        let mut bus = self.bus.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *bus = fresh;
    }

    /// Number of live subscription streams.
    pub fn subscriber_count(&self) -> usize {
        self.bus
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .receiver_count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        if !self.available.load(Ordering::Acquire) {
            return Err(CacheError::Unavailable("memory cache marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.check()?;
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), CacheError> {
        self.check()?;
        let pending_failures = self.failing_publishes.load(Ordering::Acquire);
        if pending_failures > 0 {
            self.failing_publishes.store(pending_failures - 1, Ordering::Release);
            return Err(CacheError::Unavailable("publish refused".to_string()));
        }
        let bus = self.bus.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // No receivers is not an error, same as PUBLISH returning 0.
        let _ = bus.send((channel.to_string(), message.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<NotificationStream, CacheError> {
        self.check()?;
        let pending_failures = self.failing_subscribes.load(Ordering::Acquire);
        if pending_failures > 0 {
            self.failing_subscribes.store(pending_failures - 1, Ordering::Release);
            return Err(CacheError::Unavailable("subscription refused".to_string()));
        }

        let rx = self
            .bus
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .subscribe();
        let channel = channel.to_string();

        let stream = futures_util::stream::unfold((rx, channel), |(mut rx, channel)| async move {
            loop {
                match rx.recv().await {
                    Ok((ch, message)) if ch == channel => return Some((message, (rx, channel))),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("In-memory subscriber lagged, {} notifications skipped", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.drop_subscriptions();
        true
    }
}
