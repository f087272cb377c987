//! # Redis Relay
//!
//! Publishes envelopes on one Redis channel and keeps the configuration cache
//! in Redis keys with an expiry. A [`ConnectionManager`] reconnects on its own,
//! so a Redis outage only surfaces as relay errors, which callers log.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use serde_json::Value;
use tracing::info;

use crate::core::relay::{Envelope, Relay};
use crate::error::{NeocortexError, Result};

fn relay_error(e: RedisError) -> NeocortexError {
    NeocortexError::Relay(e.to_string())
}

/// A relay backed by Redis.
#[derive(Clone)]
pub struct RedisRelay {
    conn: ConnectionManager,
    channel: String,
}

impl RedisRelay {
    /// Connects to `url` (e.g. `redis://127.0.0.1/`) and publishes on `channel`.
    pub async fn connect(url: &str, channel: &str) -> Result<Self> {
        let client = Client::open(url).map_err(relay_error)?;
        let conn = client.get_connection_manager().await.map_err(relay_error)?;
        info!("Redis relay connected, channel '{}'", channel);
        Ok(Self {
            conn,
            channel: channel.to_string(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl Relay for RedisRelay {
    async fn publish(&self, topic: &str, data: Value) -> Result<()> {
        let message = serde_json::to_string(&Envelope::new(topic, data))?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(&self.channel, message).await.map_err(relay_error)?;
        Ok(())
    }

    async fn cache_get(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await.map_err(relay_error)?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn cache_set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        let _: () = conn
            .set_ex(key, value.to_string(), seconds)
            .await
            .map_err(relay_error)?;
        Ok(())
    }

    async fn cache_delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await.map_err(relay_error)?;
        Ok(())
    }
}
