//! # Service Settings
//!
//! Static settings of the nervous system (scheduler cadence, relay channel,
//! mail sender). Dynamic, operator-editable values live in the plasticity
//! module instead; [`default_entries`] lists the ones seeded at start-up.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::mailer::MailerConfig;
use crate::core::relay::DEFAULT_CHANNEL;
use crate::error::Result;

/// Cadence of the scheduled jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClockSettings {
    pub route_interval_secs: u64,
    pub task_interval_secs: u64,
    pub metrics_interval_secs: u64,
    pub health_interval_secs: u64,
    /// Six-field cron expression (with seconds), evaluated in UTC.
    pub cleanup_cron: String,
    pub initial_delay_secs: u64,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            route_interval_secs: 10,
            task_interval_secs: 30,
            metrics_interval_secs: 3600,
            health_interval_secs: 300,
            cleanup_cron: "0 0 3 * * *".to_string(),
            initial_delay_secs: 5,
        }
    }
}

impl ClockSettings {
    pub fn route_interval(&self) -> Duration {
        Duration::from_secs(self.route_interval_secs.max(1))
    }

    pub fn task_interval(&self) -> Duration {
        Duration::from_secs(self.task_interval_secs.max(1))
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }
}

/// Everything the library needs besides the store and the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NeocortexSettings {
    /// Pub/sub channel carrying the envelopes.
    pub channel: String,
    /// Buffer of the in-process relay.
    pub relay_capacity: usize,
    pub clock: ClockSettings,
    pub mailer: MailerConfig,
}

impl Default for NeocortexSettings {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            relay_capacity: 1024,
            clock: ClockSettings::default(),
            mailer: MailerConfig::default(),
        }
    }
}

impl NeocortexSettings {
    /// Reads a JSON settings file; absent fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Applies the `SENDGRID_*` environment variables over the mailer settings.
    pub fn with_mail_env(mut self) -> Self {
        if let Ok(key) = std::env::var("SENDGRID_API_KEY") {
            self.mailer.api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Ok(from) = std::env::var("SENDGRID_FROM_EMAIL") {
            self.mailer.from_email = from;
        }
        if let Ok(name) = std::env::var("SENDGRID_FROM_NAME") {
            self.mailer.from_name = name;
        }
        self
    }
}

/// Dynamic configuration seeded when missing: `(key, value, description)`.
pub fn default_entries() -> Vec<(&'static str, Value, &'static str)> {
    vec![
        ("signal.batch_size", json!(100), "Signaux routés par cycle"),
        ("signal.ttl_default_seconds", json!(86400), "Durée de vie par défaut d'un signal"),
        ("moteur.max_concurrent_tasks", json!(10), "Tâches traitées par cycle"),
        ("plasticite.ajustement_pas", json!(0.05), "Pas d'ajustement des poids adaptatifs"),
        ("prefrontal.score_seuil_auto_approve", json!(0.85), "Seuil d'approbation automatique"),
        ("historique.retention_jours", json!(365), "Rétention de l'historique"),
    ]
}
