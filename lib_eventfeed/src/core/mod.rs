//! # Snapshot Pipeline
//!
//! Refresher (Postgres to Redis), notification bridge (Redis pub/sub to the
//! fan-out), connection registry with its liveness sweep, and the WebSocket
//! fan-out server. The refresher and the server run in separate processes and
//! share nothing but the cache substrate.

pub mod bridge;
pub mod fanout;
pub mod lifecycle;
pub mod refresher;
pub mod registry;
pub mod snapshot;
