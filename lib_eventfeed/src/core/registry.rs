//! # Connection Registry
//!
//! Owns one record per live client connection: the sending half of the
//! connection's outbound queue, its liveness flag, and a cancellation token
//! that forcibly ends the connection task.
//!
//! Each connection has a dedicated writer task draining an unbounded queue,
//! so a broadcast or a sweep never waits on a slow socket, and frames reach a
//! given client in the order they were queued.
//!
//! ## Liveness sweep
//!
//! On every sweep each record is checked:
//!
//! - flag set: clear it and queue a ping (`Alive` to `Unconfirmed`);
//! - flag clear: the previous ping went unanswered, so the record is
//!   closed and removed (`Unconfirmed` to `Evicted`).
//!
//! A ping response sets the flag again. A silent client is therefore
//! evicted on the second sweep after its last response.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub type ConnectionId = u64;

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A full snapshot payload.
    Snapshot(Arc<str>),
    /// Liveness check, sent as a WebSocket ping.
    Ping,
    /// Close the transport and stop writing.
    Close,
}

struct ConnectionRecord {
    sender: mpsc::UnboundedSender<Outbound>,
    alive: AtomicBool,
    cancel: CancellationToken,
}

/// The connection task's side of a registration.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// Frames to write to the transport, in order.
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    /// Fires when the registry evicts the connection or shuts down.
    pub cancel: CancellationToken,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Registered but no longer writable.
    pub skipped: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub evicted: usize,
}

pub struct ConnectionRegistry {
    records: Mutex<HashMap<ConnectionId, Arc<ConnectionRecord>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<ConnectionRecord>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Point-in-time copy of the registered records. Broadcasts and sweeps
    /// iterate this copy so the lock is never held across a send.
    fn current(&self) -> Vec<(ConnectionId, Arc<ConnectionRecord>)> {
        self.records()
            .iter()
            .map(|(id, record)| (*id, Arc::clone(record)))
            .collect()
    }

    /// Creates a record marked alive. `None` once the registry is closed.
    ///
    /// The record is fully built before it becomes visible to broadcasts
    /// and sweeps.
    pub fn register(&self) -> Option<ConnectionHandle> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, outbound) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();
        let record = Arc::new(ConnectionRecord {
            sender,
            alive: AtomicBool::new(true),
            cancel: cancel.clone(),
        });

        {
            let mut records = self.records();
            // Re-checked under the lock so close_all cannot miss this record.
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            records.insert(id, record);
        }
        tracing::debug!("Connection {} registered", id);
        Some(ConnectionHandle { id, outbound, cancel })
    }

    /// Queues a frame for one connection. `false` if it is gone or unwritable.
    pub fn send_to(&self, id: ConnectionId, frame: Outbound) -> bool {
        let record = self.records().get(&id).cloned();
        match record {
            Some(record) => record.sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Records a ping response.
    pub fn mark_alive(&self, id: ConnectionId) {
        if let Some(record) = self.records().get(&id) {
            record.alive.store(true, Ordering::Release);
        }
    }

    /// Liveness flag of a registered connection.
    pub fn is_alive(&self, id: ConnectionId) -> Option<bool> {
        self.records()
            .get(&id)
            .map(|record| record.alive.load(Ordering::Acquire))
    }

    /// Drops a record after its transport closed. Safe to call repeatedly.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.records().remove(&id);
        match removed {
            Some(record) => {
                record.cancel.cancel();
                tracing::debug!("Connection {} removed", id);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Queues `payload` for every connection registered right now.
    /// Unwritable connections are skipped, not evicted.
    pub fn broadcast(&self, payload: Arc<str>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for (id, record) in self.current() {
            if record.sender.send(Outbound::Snapshot(Arc::clone(&payload))).is_ok() {
                report.delivered += 1;
            } else {
                tracing::debug!("Skipping unwritable connection {}", id);
                report.skipped += 1;
            }
        }
        report
    }

    /// One pass of the liveness state machine over every record.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for (id, record) in self.current() {
            if record.alive.swap(false, Ordering::AcqRel) {
                // An unwritable transport simply misses the ping and is
                // evicted next time round.
                let _ = record.sender.send(Outbound::Ping);
                report.pinged += 1;
            } else {
                let _ = record.sender.send(Outbound::Close);
                record.cancel.cancel();
                self.records().remove(&id);
                tracing::info!("Connection {} failed liveness check, evicted", id);
                report.evicted += 1;
            }
        }
        report
    }

    /// Sweeps every `interval` until `shutdown` fires. The first sweep runs
    /// one full interval after start.
    pub async fn run_sweeper(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep();
                    tracing::debug!(
                        pinged = report.pinged,
                        evicted = report.evicted,
                        "Liveness sweep complete"
                    );
                }
            }
        }
        tracing::info!("Liveness sweeper stopped");
    }

    /// Closes every connection and refuses new ones. Returns how many
    /// connections this call closed; repeated calls return 0.
    pub fn close_all(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let drained: Vec<Arc<ConnectionRecord>> = {
            let mut records = self.records();
            records.drain().map(|(_, record)| record).collect()
        };
        for record in &drained {
            let _ = record.sender.send(Outbound::Close);
        }
        self.shutdown.cancel();
        tracing::info!("Closed {} client connections", drained.len());
        drained.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
