//! # lib_eventfeed
//!
//! Shared library for the `eventfeed` workspace: a periodically refreshed
//! snapshot of recent events travels from Postgres through Redis to every
//! connected WebSocket client.
//!
//! Modules are gated by folder-level features so that a binary only links
//! the drivers it needs.

#[cfg(feature = "configs")]
pub mod configs;

#[cfg(feature = "connections")]
pub mod connections;

#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(feature = "core")]
pub mod core;
