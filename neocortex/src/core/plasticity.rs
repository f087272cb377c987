//! # Plasticity: Dynamic Configuration & Adaptive Weights
//!
//! Lets operators change the system's behaviour without a redeploy. Reads go
//! through the relay cache (five minutes) before hitting the store; writes bump
//! the entry version and invalidate the cached copy.
//!
//! Adaptive weights are reinforced on success and weakened on failure by a
//! configurable step, and always stay within `[0, 1]`.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::Result;
use crate::core::relay::Relay;
use crate::store::{AdaptiveWeight, ConfigEntry, Store};

/// Cache key prefix of configuration values.
pub const CACHE_PREFIX: &str = "neocortex:config:";
/// Lifetime of a cached configuration value.
pub const CACHE_TTL: Duration = Duration::from_secs(300);

/// Config key of the weight adjustment step.
pub const KEY_ADJUST_STEP: &str = "plasticite.ajustement_pas";
const DEFAULT_ADJUST_STEP: f64 = 0.05;

#[derive(Clone)]
pub struct Plasticity {
    store: Arc<dyn Store>,
    relay: Arc<dyn Relay>,
}

impl Plasticity {
    pub fn new(store: Arc<dyn Store>, relay: Arc<dyn Relay>) -> Self {
        Self { store, relay }
    }

    /// Reads a value, cache first. Cache failures fall through to the store.
    pub async fn read(&self, key: &str) -> Result<Option<Value>> {
        let cache_key = format!("{}{}", CACHE_PREFIX, key);
        match self.relay.cache_get(&cache_key).await {
            Ok(Some(v)) => return Ok(Some(v)),
            Ok(None) => {}
            Err(e) => debug!("[Plasticite] Cache read skipped for {}: {}", key, e),
        }

        let Some(entry) = self.store.get_config(key).await? else {
            return Ok(None);
        };
        if let Err(e) = self.relay.cache_set(&cache_key, &entry.valeur, CACHE_TTL).await {
            debug!("[Plasticite] Cache write skipped for {}: {}", key, e);
        }
        Ok(Some(entry.valeur))
    }

    /// Typed read. Missing keys, unreadable values and store errors yield `default`.
    pub async fn read_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.read(key).await {
            Ok(Some(v)) => serde_json::from_value(v).unwrap_or(default),
            Ok(None) => default,
            Err(e) => {
                debug!("[Plasticite] Falling back to default for {}: {}", key, e);
                default
            }
        }
    }

    /// Creates or updates an entry and invalidates its cached value.
    pub async fn write(
        &self,
        key: &str,
        value: &Value,
        modified_by: Option<&str>,
        description: Option<&str>,
    ) -> Result<ConfigEntry> {
        let entry = self.store.upsert_config(key, value, description, modified_by).await?;
        if let Err(e) = self.relay.cache_delete(&format!("{}{}", CACHE_PREFIX, key)).await {
            debug!("[Plasticite] Cache invalidation skipped for {}: {}", key, e);
        }
        info!("[Plasticite] {} set to {} (v{})", key, value, entry.version);
        Ok(entry)
    }

    /// All entries, or those of one category.
    pub async fn list(&self, category: Option<&str>) -> Result<Vec<ConfigEntry>> {
        self.store.list_configs(category).await
    }

    /// Adaptive weights of a signal type, heaviest first.
    pub async fn weights(&self, signal_type: &str) -> Result<Vec<AdaptiveWeight>> {
        self.store.list_weights(signal_type).await
    }

    /// Reinforces (`success`) or weakens a rule and returns its new weight.
    ///
    /// Unknown pairs are created at `0.5 ± step`.
    pub async fn adjust_weight(&self, signal_type: &str, rule: &str, success: bool) -> Result<f64> {
        let step = self.read_or(KEY_ADJUST_STEP, DEFAULT_ADJUST_STEP).await;
        let delta = if success { step } else { -step };

        if let Some(weight) = self.store.adjust_weight(signal_type, rule, delta, success).await? {
            return Ok(weight);
        }
        let initial = (0.5 + delta).clamp(0.0, 1.0);
        self.store.insert_weight(signal_type, rule, initial, success).await?;
        Ok(initial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::relay::LocalRelay;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn plasticity() -> (Plasticity, MemoryStore, LocalRelay) {
        let store = MemoryStore::new();
        let relay = LocalRelay::default();
        let p = Plasticity::new(Arc::new(store.clone()), Arc::new(relay.clone()));
        (p, store, relay)
    }

    #[tokio::test]
    async fn read_populates_cache() {
        let (p, store, relay) = plasticity();
        store.upsert_config("signal.batch_size", &json!(100), None, None).await.unwrap();

        assert_eq!(p.read("signal.batch_size").await.unwrap(), Some(json!(100)));
        assert_eq!(
            relay.cache_get("neocortex:config:signal.batch_size").await.unwrap(),
            Some(json!(100))
        );
        assert_eq!(p.read("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_bumps_version_and_invalidates() {
        let (p, _, relay) = plasticity();
        p.write("moteur.max_concurrent_tasks", &json!(10), Some("u1"), Some("tasks")).await.unwrap();
        assert_eq!(p.read("moteur.max_concurrent_tasks").await.unwrap(), Some(json!(10)));

        let entry = p.write("moteur.max_concurrent_tasks", &json!(20), Some("u2"), None).await.unwrap();
        assert_eq!(entry.version, 2);
        assert_eq!(
            relay.cache_get("neocortex:config:moteur.max_concurrent_tasks").await.unwrap(),
            None
        );
        assert_eq!(p.read("moteur.max_concurrent_tasks").await.unwrap(), Some(json!(20)));
    }

    #[tokio::test]
    async fn read_or_falls_back_on_wrong_shape() {
        let (p, _, _) = plasticity();
        p.write("signal.batch_size", &json!("lots"), None, None).await.unwrap();
        assert_eq!(p.read_or::<usize>("signal.batch_size", 100).await, 100);
        assert_eq!(p.read_or::<usize>("absent", 7).await, 7);
    }

    #[tokio::test]
    async fn new_weights_start_around_half() {
        let (p, _, _) = plasticity();
        assert_eq!(p.adjust_weight("NOMINATION_EVALUATION", "completude", true).await.unwrap(), 0.55);
        assert_eq!(p.adjust_weight("NOMINATION_EVALUATION", "urgence", false).await.unwrap(), 0.45);

        let weights = p.weights("NOMINATION_EVALUATION").await.unwrap();
        assert_eq!(weights[0].regle, "completude");
        assert_eq!(weights[0].reussites, 1);
        assert_eq!(weights[1].echecs, 1);
    }

    #[tokio::test]
    async fn weights_stay_within_bounds() {
        let (p, _, _) = plasticity();
        p.write(KEY_ADJUST_STEP, &json!(0.4), None, None).await.unwrap();
        p.adjust_weight("X", "r", true).await.unwrap();
        let w = p.adjust_weight("X", "r", true).await.unwrap();
        assert_eq!(w, 1.0);
        for _ in 0..4 {
            p.adjust_weight("X", "r", false).await.unwrap();
        }
        assert_eq!(p.weights("X").await.unwrap()[0].poids, 0.0);
    }
}
