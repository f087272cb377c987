//! # Limbic System: the Signal Bus
//!
//! Every business mutation ends up here. A signal is persisted unprocessed,
//! announced on `neocortex:signal`, then routed to the cortex modules that
//! consume it:
//!
//! ```text
//! emit() ──► Store ──► relay "neocortex:signal"
//!   │
//!   └─ CRITICAL ──► route now (spawned task)
//! circadian clock ──► route_pending(batch) ──► mark processed
//!                                           ├─► relay "neocortex:route:<CORTEX>"
//!                                           └─► in-process subscribers of <CORTEX>
//! ```
//!
//! In-process fan-out follows the same pattern as a websocket dispatcher: one
//! unbounded channel per subscriber, and senders whose receiver was dropped are
//! pruned on the next delivery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::relay::Relay;
use crate::core::signal::{
    new_correlation_id, priority_for, CortexModule, Endpoint, Priority, Signal, SignalType,
};
use crate::error::Result;
use crate::store::{SignalStats, Store};

/// Topic announcing every emitted signal.
pub const TOPIC_SIGNAL: &str = "neocortex:signal";
/// Prefix of the per-cortex routing topics.
pub const TOPIC_ROUTE_PREFIX: &str = "neocortex:route:";

/// Default batch size of [`SignalBus::route_pending`].
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Default retention of processed signals, in days.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Optional fields of [`SignalBus::emit_business`].
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub correlation_id: Option<Uuid>,
    pub confiance: Option<f64>,
    pub parent_signal_id: Option<Uuid>,
    pub destination: Option<Endpoint>,
}

/// What a cortex receives when a signal is routed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutedSignal {
    pub signal_id: Uuid,
    #[serde(rename = "type")]
    pub kind: SignalType,
    pub entite_type: Option<String>,
    pub entite_id: Option<String>,
    pub payload: Value,
    pub priorite: Priority,
    pub confiance: f64,
}

/// Summary row of the unprocessed backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSignal {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: SignalType,
    pub priorite: Priority,
    pub entite_type: Option<String>,
    pub confiance: f64,
    pub created_at: DateTime<Utc>,
}

/// A page of the backlog plus the total backlog size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingList {
    pub signaux: Vec<PendingSignal>,
    pub total: u64,
}

/// Cortex modules a signal type is routed to when no destination is given.
pub fn routing_table(kind: SignalType) -> &'static [CortexModule] {
    use CortexModule::*;
    match kind {
        SignalType::NominationCreee => &[Hippocampe, Auditif, Prefrontal],
        SignalType::NominationValidee => &[Hippocampe, Auditif, Moteur],
        SignalType::NominationTransition => &[Hippocampe, Auditif, Prefrontal],
        SignalType::GarRapportSoumis => &[Hippocampe, Auditif, Prefrontal],
        SignalType::GarRapportValide => &[Hippocampe, Auditif],
        SignalType::TexteLegislatifSoumis => &[Hippocampe, Auditif, Prefrontal],
        SignalType::TexteLegislatifPublie => &[Hippocampe, Auditif, Moteur],
        SignalType::JoPublication => &[Hippocampe, Auditif, Moteur],
        SignalType::PtmInitiativeSoumise => &[Hippocampe, Auditif, Prefrontal],
        SignalType::EgopCiPlanifie => &[Hippocampe, Auditif],
        SignalType::AlerteSysteme => &[Monitoring, Auditif],
        SignalType::ConfigModifiee => &[Plasticite, Hippocampe],
        SignalType::TacheEchouee => &[Monitoring, Auditif],
        SignalType::SecuriteConnexionEchouee => &[Monitoring, Hippocampe],
        SignalType::SecuriteBruteForce => &[Monitoring, Auditif, Hippocampe],
        SignalType::SecuriteAccesRefuse => &[Hippocampe],
        _ => &[Hippocampe],
    }
}

/// Destinations of a signal: the explicit one, else the routing table.
pub fn destinations_for(signal: &Signal) -> Vec<Endpoint> {
    match &signal.destination {
        Some(dest) => vec![dest.clone()],
        None => routing_table(signal.kind).iter().map(|c| Endpoint::Cortex(*c)).collect(),
    }
}

type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<Arc<RoutedSignal>>>>;

/// The signal bus.
#[derive(Clone)]
pub struct SignalBus {
    store: Arc<dyn Store>,
    relay: Arc<dyn Relay>,
    subscribers: Arc<Mutex<Subscribers>>,
}

impl SignalBus {
    pub fn new(store: Arc<dyn Store>, relay: Arc<dyn Relay>) -> Self {
        Self {
            store,
            relay,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Persists a signal and announces it. CRITICAL signals are routed at once.
    pub async fn emit(&self, signal: Signal) -> Result<Uuid> {
        let id = self.store.insert_signal(&signal).await.map_err(|e| {
            error!("[Limbique] Failed to emit {}: {}", signal.kind, e);
            e
        })?;

        let summary = json!({
            "id": id,
            "type": signal.kind,
            "priorite": signal.priorite,
            "entiteType": signal.entite_type,
            "entiteId": signal.entite_id,
        });
        if let Err(e) = self.relay.publish(TOPIC_SIGNAL, summary).await {
            debug!("[Limbique] Publish skipped: {}", e);
        }

        if signal.priorite == Priority::Critical {
            let bus = self.clone();
            tokio::spawn(async move {
                bus.route_signal(id, &signal).await;
            });
        }

        Ok(id)
    }

    /// Emits a business signal from the limbic system with derived priority.
    pub async fn emit_business(
        &self,
        kind: SignalType,
        entite_type: &str,
        entite_id: &str,
        payload: Value,
        options: EmitOptions,
    ) -> Result<Uuid> {
        self.emit(Signal {
            kind,
            source: Endpoint::Cortex(CortexModule::Limbique),
            destination: options.destination,
            entite_type: Some(entite_type.to_string()),
            entite_id: Some(entite_id.to_string()),
            payload,
            confiance: options.confiance.unwrap_or(1.0),
            priorite: priority_for(kind),
            correlation_id: options.correlation_id.unwrap_or_else(new_correlation_id),
            parent_signal_id: options.parent_signal_id,
            ttl_seconds: None,
        })
        .await
    }

    /// Receives every signal routed to `cortex` from now on.
    pub fn subscribe(&self, cortex: impl Into<Endpoint>) -> mpsc::UnboundedReceiver<Arc<RoutedSignal>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = cortex.into().as_str().to_string();
        let mut subs = self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        subs.entry(key.clone()).or_default().push(tx);
        debug!("[Limbique] Subscriber added for {}", key);
        rx
    }

    /// Routes one stored signal. Failures are written on the signal, never raised.
    pub async fn route_signal(&self, id: Uuid, signal: &Signal) {
        if let Err(e) = self.try_route(id, signal).await {
            error!("[Limbique] Routing of {} failed: {}", id, e);
            if let Err(e) = self.store.mark_signal_error(id, &e.to_string()).await {
                warn!("[Limbique] Could not record routing error on {}: {}", id, e);
            }
        }
    }

    async fn try_route(&self, id: Uuid, signal: &Signal) -> Result<()> {
        let destinations = destinations_for(signal);
        self.store.mark_signal_processed(id).await?;

        let routed = Arc::new(RoutedSignal {
            signal_id: id,
            kind: signal.kind,
            entite_type: signal.entite_type.clone(),
            entite_id: signal.entite_id.clone(),
            payload: signal.payload.clone(),
            priorite: signal.priorite,
            confiance: signal.confiance,
        });
        let data = serde_json::to_value(&*routed)?;

        for dest in &destinations {
            let topic = format!("{}{}", TOPIC_ROUTE_PREFIX, dest);
            if let Err(e) = self.relay.publish(&topic, data.clone()).await {
                debug!("[Limbique] Publish to {} skipped: {}", topic, e);
            }
            self.deliver(dest, &routed);
        }
        Ok(())
    }

    fn deliver(&self, dest: &Endpoint, routed: &Arc<RoutedSignal>) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(senders) = subs.get_mut(dest.as_str()) {
            senders.retain(|tx| tx.send(Arc::clone(routed)).is_ok());
            if senders.is_empty() {
                subs.remove(dest.as_str());
            }
        }
    }

    /// Routes up to `batch` unprocessed signals, most urgent first. Returns the count.
    pub async fn route_pending(&self, batch: usize) -> Result<usize> {
        let pending = self.store.pending_signals(batch).await?;
        let count = pending.len();
        for stored in pending {
            self.route_signal(stored.id, &stored.signal).await;
        }
        Ok(count)
    }

    /// Deletes processed signals past their TTL or older than the retention.
    pub async fn purge(&self, retention_days: i64) -> Result<u64> {
        let now = Utc::now();
        let purged = self
            .store
            .purge_signals(now, now - Duration::days(retention_days))
            .await?;
        if purged > 0 {
            info!("[Limbique] Purged {} signals", purged);
        }
        Ok(purged)
    }

    /// The unprocessed backlog in routing order.
    pub async fn list_unprocessed(&self, limit: usize) -> Result<PendingList> {
        let rows = self.store.pending_signals(limit).await?;
        let total = self.store.count_pending_signals().await?;
        let signaux = rows
            .into_iter()
            .map(|s| PendingSignal {
                id: s.id,
                kind: s.signal.kind,
                priorite: s.signal.priorite,
                entite_type: s.signal.entite_type,
                confiance: s.signal.confiance,
                created_at: s.created_at,
            })
            .collect();
        Ok(PendingList { signaux, total })
    }

    /// Totals plus the last 24 hours by priority and by type.
    pub async fn stats(&self) -> Result<SignalStats> {
        self.store.signal_stats(Utc::now() - Duration::hours(24)).await
    }
}
