//! # Relay Port
//!
//! Publish/subscribe and short-lived cache used by the bus and the
//! configuration layer. [`LocalRelay`] keeps everything in the process;
//! `connections::cache_redis::RedisRelay` talks to Redis.
//!
//! Every published message is wrapped in the same envelope:
//! `{"type": <topic>, "data": {...}, "timestamp": <unix ms>}`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;

/// Default channel carrying every envelope.
pub const DEFAULT_CHANNEL: &str = "notifications";

/// A message as it travels on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub topic: String,
    pub data: Value,
    /// Unix time in milliseconds.
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(topic: &str, data: Value) -> Self {
        Self {
            topic: topic.to_string(),
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Pub/sub and cache operations.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Publishes `data` under `topic`.
    async fn publish(&self, topic: &str, data: Value) -> Result<()>;
    async fn cache_get(&self, key: &str) -> Result<Option<Value>>;
    async fn cache_set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()>;
    async fn cache_delete(&self, key: &str) -> Result<()>;
}

/// In-process relay: a tokio broadcast channel plus a TTL map.
#[derive(Clone)]
pub struct LocalRelay {
    tx: broadcast::Sender<Envelope>,
    cache: Arc<Mutex<HashMap<String, (Value, Instant)>>>,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl LocalRelay {
    /// Creates a relay whose subscribers may lag up to `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Receives every envelope published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Relay for LocalRelay {
    async fn publish(&self, topic: &str, data: Value) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.tx.send(Envelope::new(topic, data));
        Ok(())
    }

    async fn cache_get(&self, key: &str) -> Result<Option<Value>> {
        let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match cache.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                cache.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn cache_set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.insert(key.to_string(), (value.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn cache_delete(&self, key: &str) -> Result<()> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(key);
        Ok(())
    }
}
