//! # Notification Bridge
//!
//! Listens on the change-notification channel and, for every message,
//! re-reads the cached snapshot and hands it to the connection registry for
//! broadcast. The message body itself is never forwarded.
//!
//! Subscription is an explicit retry loop rather than a self-rescheduling
//! callback:
//!
//! ```text
//! Unsubscribed --subscribe ok--> Subscribed --stream ends--> PendingRetry
//!      ^   \--subscribe failed--> PendingRetry                  |
//!      \------------------- retry delay elapsed ----------------/
//! ```
//!
//! The retry delay is fixed and attempts are unlimited. A subscription that
//! drops after being established goes back through the same loop.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::connections::cache::{SnapshotCache, SNAPSHOT_KEY, UPDATES_CHANNEL};
use crate::core::registry::{BroadcastReport, ConnectionRegistry};
use crate::loggers::loggerlocal::error_chain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Unsubscribed,
    Subscribed,
    PendingRetry,
    Stopped,
}

pub struct NotificationBridge<C> {
    cache: Arc<C>,
    registry: Arc<ConnectionRegistry>,
    retry_delay: Duration,
    state: watch::Sender<BridgeState>,
}

impl<C: SnapshotCache> NotificationBridge<C> {
    pub fn new(cache: Arc<C>, registry: Arc<ConnectionRegistry>, retry_delay: Duration) -> Self {
        let (state, _) = watch::channel(BridgeState::Unsubscribed);
        Self {
            cache,
            registry,
            retry_delay,
            state,
        }
    }

    /// Observes state transitions.
    pub fn watch_state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    fn set_state(&self, next: BridgeState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!("Notification bridge {:?} -> {:?}", previous, next);
        }
    }

    /// Reacts to one change notification. Returns `None` when nothing was
    /// broadcast because the snapshot could not be read or is absent.
    pub async fn relay(&self, notification: &str) -> Option<BroadcastReport> {
        tracing::trace!(notification, "Change notification received");
        match self.cache.get(SNAPSHOT_KEY).await {
            Ok(Some(payload)) => {
                let report = self.registry.broadcast(Arc::from(payload));
                tracing::debug!(
                    delivered = report.delivered,
                    skipped = report.skipped,
                    "Snapshot broadcast"
                );
                Some(report)
            }
            Ok(None) => {
                tracing::warn!("Change notification received but no snapshot is cached");
                None
            }
            Err(e) => {
                tracing::error!(error = %error_chain(&e), "Error fetching snapshot from Redis");
                None
            }
        }
    }

    /// Subscribes and relays until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        'outer: loop {
            self.set_state(BridgeState::Unsubscribed);
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => break 'outer,
                attempt = self.cache.subscribe(UPDATES_CHANNEL) => attempt,
            };

            match attempt {
                Ok(mut notifications) => {
                    self.set_state(BridgeState::Subscribed);
                    tracing::info!("Subscribed to Redis {} channel", UPDATES_CHANNEL);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break 'outer,
                            next = notifications.next() => match next {
                                Some(message) => {
                                    self.relay(&message).await;
                                }
                                None => {
                                    tracing::warn!("Redis subscription ended, resubscribing");
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(
                        error = %error_chain(&e),
                        retry_in = ?self.retry_delay,
                        "Failed to subscribe to Redis channel"
                    );
                }
            }

            self.set_state(BridgeState::PendingRetry);
            tokio::select! {
                _ = shutdown.cancelled() => break 'outer,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
        self.set_state(BridgeState::Stopped);
        tracing::info!("Notification bridge stopped");
    }
}
