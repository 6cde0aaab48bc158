//! # Snapshot Refresher
//!
//! A self-scheduling poller. Every tick it reads the most recent events from
//! the source of truth, writes the encoded snapshot to the cache with one
//! atomic `SET`, then publishes a change notification.
//!
//! A failed cycle is logged and abandoned; nothing it produced reaches the
//! cache. The next tick is the only retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::connections::cache::{CacheError, SnapshotCache, SNAPSHOT_KEY, UPDATES_CHANNEL};
use crate::connections::db_postgres::{EventSource, SourceError};
use crate::core::snapshot::{ChangeNotification, Snapshot, SNAPSHOT_LIMIT};
use crate::loggers::loggerlocal::error_chain;

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("Failed to query recent events")]
    Source(#[from] SourceError),
    #[error("Failed to serialize snapshot")]
    Serialize(#[source] serde_json::Error),
    #[error("Failed to write snapshot")]
    CacheWrite(#[source] CacheError),
    #[error("Failed to publish change notification")]
    Publish(#[source] CacheError),
}

/// Outcome of one successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    pub events: usize,
    pub sequence: u64,
}

pub struct SnapshotRefresher<S, C> {
    source: Arc<S>,
    cache: Arc<C>,
    interval: Duration,
    sequence: AtomicU64,
}

impl<S: EventSource, C: SnapshotCache> SnapshotRefresher<S, C> {
    pub fn new(source: Arc<S>, cache: Arc<C>, interval: Duration) -> Self {
        Self {
            source,
            cache,
            interval,
            sequence: AtomicU64::new(0),
        }
    }

    /// Runs a single refresh cycle.
    pub async fn refresh_once(&self) -> Result<RefreshReport, RefreshError> {
        let events = self.source.fetch_recent(SNAPSHOT_LIMIT).await?;
        let snapshot = Snapshot::from_events(events);
        let payload = snapshot.encode().map_err(RefreshError::Serialize)?;

        self.cache
            .set(SNAPSHOT_KEY, &payload)
            .await
            .map_err(RefreshError::CacheWrite)?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let notification = ChangeNotification::new(sequence)
            .encode()
            .map_err(RefreshError::Serialize)?;
        self.cache
            .publish(UPDATES_CHANNEL, &notification)
            .await
            .map_err(RefreshError::Publish)?;

        Ok(RefreshReport {
            events: snapshot.len(),
            sequence,
        })
    }

    /// Refreshes immediately, then once per interval, until `shutdown` fires.
    /// A cycle still in flight at shutdown is dropped, which returns its
    /// pooled connection.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("Snapshot refresher running every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        result = self.refresh_once() => match result {
                            Ok(report) => tracing::info!(
                                events = report.events,
                                sequence = report.sequence,
                                "Redis snapshot and events updated"
                            ),
                            Err(e) => tracing::error!(
                                error = %error_chain(&e),
                                "Error updating Redis snapshot"
                            ),
                        },
                    }
                }
            }
        }
        tracing::info!("Snapshot refresher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::cache_memory::MemoryCache;
    use crate::connections::db_postgres::Event;
    use crate::core::snapshot::tests::event;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Replays scripted query results, then keeps returning the last one.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Vec<Event>, String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Vec<Event>, String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn fetch_recent(&self, limit: i64) -> Result<Vec<Event>, SourceError> {
            assert_eq!(limit, SNAPSHOT_LIMIT);
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            };
            match next {
                Some(Ok(events)) => Ok(events),
                Some(Err(reason)) => Err(SourceError::Unavailable(reason)),
                None => Ok(Vec::new()),
            }
        }

        async fn close(&self) -> bool {
            true
        }
    }

    fn rows(ids: std::ops::RangeInclusive<i64>) -> Vec<Event> {
        ids.rev().map(event).collect()
    }

    #[tokio::test]
    async fn cycle_writes_snapshot_then_announces_it() {
        let cache = Arc::new(MemoryCache::new());
        let mut notifications = cache.subscribe(UPDATES_CHANNEL).await.unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Ok(rows(6..=105))]));
        let refresher = SnapshotRefresher::new(source, cache.clone(), Duration::from_secs(15));

        let report = refresher.refresh_once().await.unwrap();
        assert_eq!(report, RefreshReport { events: 100, sequence: 1 });

        let stored = cache.get(SNAPSHOT_KEY).await.unwrap().unwrap();
        let snapshot = Snapshot::decode(&stored).unwrap();
        assert_eq!(snapshot.events().first().map(|e| e.id), Some(105));
        assert_eq!(snapshot.events().last().map(|e| e.id), Some(6));

        let raw = notifications.next().await.unwrap();
        let notification: ChangeNotification = serde_json::from_str(&raw).unwrap();
        assert_eq!(notification.sequence, 1);
    }

    #[tokio::test]
    async fn empty_result_is_still_written_and_announced() {
        let cache = Arc::new(MemoryCache::new());
        let mut notifications = cache.subscribe(UPDATES_CHANNEL).await.unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Ok(Vec::new())]));
        let refresher = SnapshotRefresher::new(source, cache.clone(), Duration::from_secs(15));

        let report = refresher.refresh_once().await.unwrap();
        assert_eq!(report.events, 0);
        assert_eq!(cache.get(SNAPSHOT_KEY).await.unwrap().as_deref(), Some("[]"));
        assert!(notifications.next().await.is_some());
    }

    #[tokio::test]
    async fn failed_query_leaves_previous_snapshot_untouched() {
        let cache = Arc::new(MemoryCache::new());
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(rows(1..=3)),
            Err("connection refused".to_string()),
        ]));
        let refresher = SnapshotRefresher::new(source, cache.clone(), Duration::from_secs(15));

        refresher.refresh_once().await.unwrap();
        let before = cache.get(SNAPSHOT_KEY).await.unwrap();

        let err = refresher.refresh_once().await.unwrap_err();
        assert!(matches!(err, RefreshError::Source(_)));
        assert_eq!(cache.get(SNAPSHOT_KEY).await.unwrap(), before);
    }

    #[tokio::test]
    async fn cache_outage_is_reported_as_write_failure() {
        let cache = Arc::new(MemoryCache::new());
        cache.set_available(false);
        let source = Arc::new(ScriptedSource::new(vec![Ok(rows(1..=3))]));
        let refresher = SnapshotRefresher::new(source, cache.clone(), Duration::from_secs(15));

        assert!(matches!(
            refresher.refresh_once().await,
            Err(RefreshError::CacheWrite(CacheError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn failed_publish_keeps_the_written_snapshot() {
        let cache = Arc::new(MemoryCache::new());
        cache.fail_next_publishes(1);
        let source = Arc::new(ScriptedSource::new(vec![Ok(rows(1..=3))]));
        let refresher = SnapshotRefresher::new(source, cache.clone(), Duration::from_secs(15));

        let err = refresher.refresh_once().await.unwrap_err();
        assert!(matches!(err, RefreshError::Publish(CacheError::Unavailable(_))));

        let stored = cache.get(SNAPSHOT_KEY).await.unwrap().unwrap();
        let snapshot = Snapshot::decode(&stored).unwrap();
        assert_eq!(snapshot.events().iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 2, 1]);

        // The next cycle announces normally.
        let mut notifications = cache.subscribe(UPDATES_CHANNEL).await.unwrap();
        refresher.refresh_once().await.unwrap();
        assert!(notifications.next().await.is_some());
    }

    #[tokio::test]
    async fn rows_with_null_columns_are_written() {
        let cache = Arc::new(MemoryCache::new());
        let row = Event::from_row_json(
            7,
            json!({"id": 7, "signature": null, "raw_data": null, "event_type": "transfer"}),
        )
        .unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![row])]));
        let refresher = SnapshotRefresher::new(source, cache.clone(), Duration::from_secs(15));

        let report = refresher.refresh_once().await.unwrap();
        assert_eq!(report.events, 1);

        let stored = cache.get(SNAPSHOT_KEY).await.unwrap().unwrap();
        let written: serde_json::Value = serde_json::from_str(&stored).unwrap();
        assert_eq!(
            written,
            json!([{"id": 7, "signature": null, "raw_data": null, "event_type": "transfer"}])
        );
    }

    #[test]
    fn error_chain_renders_each_cause_once() {
        let err = RefreshError::CacheWrite(CacheError::Unavailable("down".to_string()));
        assert_eq!(error_chain(&err), "Failed to write snapshot: Cache unavailable: down");

        let err = RefreshError::Source(SourceError::Unavailable("refused".to_string()));
        assert_eq!(error_chain(&err), "Failed to query recent events: Source unavailable: refused");
    }

    #[tokio::test(start_paused = true)]
    async fn timer_keeps_running_after_a_failed_cycle() {
        let cache = Arc::new(MemoryCache::new());
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(rows(1..=2)),
            Err("query timeout".to_string()),
            Ok(rows(1..=5)),
        ]));
        let refresher = Arc::new(SnapshotRefresher::new(
            source.clone(),
            cache.clone(),
            Duration::from_millis(1_000),
        ));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let refresher = refresher.clone();
            let shutdown = shutdown.clone();
            async move { refresher.run(shutdown).await }
        });

        // Ticks at 0ms, 1000ms and 2000ms.
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        let stored = cache.get(SNAPSHOT_KEY).await.unwrap().unwrap();
        assert_eq!(Snapshot::decode(&stored).unwrap().len(), 5);
    }
}
