//! Snapshot and change-notification payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connections::db_postgres::Event;

/// Fixed bound on the number of events in a snapshot.
pub const SNAPSHOT_LIMIT: i64 = 100;

/// `type` field of every change notification.
pub const NOTIFICATION_TYPE: &str = "events_updated";

/// Up to [`SNAPSHOT_LIMIT`] events, highest identifier first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    events: Vec<Event>,
}

impl Snapshot {
    /// Orders by descending identifier and applies the size bound, so the
    /// invariant holds even if a source returns rows out of order.
    pub fn from_events(mut events: Vec<Event>) -> Self {
        events.sort_by(|a, b| b.id.cmp(&a.id));
        events.truncate(SNAPSHOT_LIMIT as usize);
        Self { events }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Wire form: a JSON array of event objects. An empty snapshot is `[]`.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.events)
    }

    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            events: serde_json::from_str(payload)?,
        })
    }
}

/// Published after each successful snapshot write. Receivers are free to
/// ignore the body; `sequence` increases by one per refresh within a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

impl ChangeNotification {
    pub fn new(sequence: u64) -> Self {
        Self {
            kind: NOTIFICATION_TYPE.to_string(),
            timestamp: Utc::now(),
            sequence,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
