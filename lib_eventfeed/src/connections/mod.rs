//! # Connections Module
//!
//! This module handles persistent connections to external services:
//! the cache substrate (key-value plus pub/sub) and the source-of-truth
//! database. Each service is consumed through a small async trait so the
//! pipeline can run against an in-process double in tests.

/// Cache substrate capability shared by every implementation.
pub mod cache;

/// Redis implementation of the cache substrate.
pub mod cache_redis;

/// In-process implementation of the cache substrate.
pub mod cache_memory;

/// Module for PostgreSQL database connection pooling and the recent-events query.
pub mod db_postgres;
