//! # Connections Module
//!
//! Backends talking to external services: the PostgreSQL store and the Redis
//! relay. Both are optional; the in-memory store and the in-process relay are
//! used when no URL is configured.

/// PostgreSQL implementation of the store, pooled with `deadpool-postgres`.
pub mod db_postgres;

/// Redis pub/sub and cache relay over a connection manager.
pub mod cache_redis;

pub use cache_redis::RedisRelay;
pub use db_postgres::PgStore;
