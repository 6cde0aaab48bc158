//! # Configuration Modules
//!
//! Process configuration for the updater and the fan-out server. Values are
//! resolved once at start-up; there is no hot reload.

/// Layered process configuration (defaults, JSON file, environment, CLI).
pub mod config_sys;
