//! # Mutation Observer
//!
//! Turns HTTP mutations of a business module into a limbic signal plus an
//! audit entry. The server's middleware layer builds a [`MutationEvent`] after
//! the handler has responded and hands it to [`MutationObserver::spawn`];
//! nothing here can delay or fail the response.
//!
//! Reads (`GET`, `HEAD`, `OPTIONS`) are never observed.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::error;
use uuid::Uuid;

use crate::core::hippocampus::Hippocampus;
use crate::core::limbic::{EmitOptions, SignalBus};
use crate::core::signal::{category_for, ActionRecord, Actor, SignalType};

/// Signal emitted for a `(module, method)` pair, if any.
pub fn signal_for(module: &str, method: &str) -> Option<SignalType> {
    use SignalType::*;
    let kind = match (module, method) {
        ("gar", "POST") => GarObjectifCree,
        ("gar", "PUT" | "PATCH") => GarObjectifModifie,
        ("gar", "DELETE") => GarObjectifSupprime,

        ("nominations", "POST") => NominationCreee,
        ("nominations", "PUT") => NominationModifiee,
        ("nominations", "PATCH") => NominationTransition,
        ("nominations", "DELETE") => NominationRejetee,

        ("legislatif", "POST") => TexteLegislatifCree,
        ("legislatif", "PUT") => TexteLegislatifModifie,
        ("legislatif", "PATCH") => TexteLegislatifSoumis,

        ("egop", "POST") => EgopCiPlanifie,
        ("egop", "PUT" | "PATCH") => EgopCiModifie,

        ("jo", "POST" | "PUT") => JoTexteAjoute,

        ("ptm", "POST") => PtmInitiativeCreee,
        ("ptm", "PUT" | "PATCH") => PtmInitiativeSoumise,

        ("institutions", "POST") => InstitutionCreee,
        ("institutions", "PUT" | "PATCH") => InstitutionModifiee,

        ("workflows", "POST") => WorkflowDemarre,
        ("workflows", "PUT" | "PATCH") => WorkflowApprouve,

        _ => return None,
    };
    Some(kind)
}

/// Audit action name of an HTTP method.
pub fn action_for_method(method: &str) -> String {
    match method {
        "POST" => "CREER".to_string(),
        "PUT" | "PATCH" => "MODIFIER".to_string(),
        "DELETE" => "SUPPRIMER".to_string(),
        other => other.to_string(),
    }
}

/// `true` for methods that are passed through unobserved.
pub fn is_read(method: &str) -> bool {
    matches!(method, "GET" | "HEAD" | "OPTIONS")
}

/// One observed mutation, captured once the response is known.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    /// Business module the route belongs to (`gar`, `nominations`, ...).
    pub module: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    /// The `id` path parameter, when the route has one.
    pub path_id: Option<String>,
    pub request_body: Option<Value>,
    pub response_body: Option<Value>,
    pub actor: Option<Actor>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub correlation_id: Uuid,
    pub duration_ms: i64,
}

impl MutationEvent {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Path id, else `data.id` of the response, else its `id`, else empty.
    pub fn entity_id(&self) -> String {
        if let Some(id) = self.path_id.as_deref().filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        let body = self.response_body.as_ref();
        body.and_then(|b| b.pointer("/data/id"))
            .or_else(|| body.and_then(|b| b.get("id")))
            .map(id_text)
            .unwrap_or_default()
    }

    fn signal_payload(&self) -> Value {
        let mut payload = json!({
            "method": self.method,
            "path": self.path,
            "statusCode": self.status,
        });
        if self.is_success() {
            payload["body"] = self.request_body.clone().unwrap_or_else(|| json!({}));
        }
        payload
    }

    fn details(&self) -> Value {
        let mut details = Map::new();
        details.insert("method".into(), json!(self.method));
        details.insert("path".into(), json!(self.path));
        details.insert("statusCode".into(), json!(self.status));
        if self.is_success() {
            if let Some(body) = &self.request_body {
                details.insert("apres".into(), body.clone());
            }
        } else {
            let erreur = self
                .response_body
                .as_ref()
                .and_then(|b| b.get("error"))
                .cloned()
                .unwrap_or(Value::Null);
            details.insert("erreur".into(), erreur);
        }
        Value::Object(details)
    }
}

fn id_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Emits and records observed mutations.
#[derive(Clone)]
pub struct MutationObserver {
    bus: SignalBus,
    hippocampus: Hippocampus,
}

impl MutationObserver {
    pub fn new(bus: SignalBus, hippocampus: Hippocampus) -> Self {
        Self { bus, hippocampus }
    }

    /// Observes the mutation in a detached task.
    pub fn spawn(self: &Arc<Self>, event: MutationEvent) -> JoinHandle<()> {
        let observer = Arc::clone(self);
        tokio::spawn(async move {
            observer.observe(event).await;
        })
    }

    /// Emits the mapped signal (if the module maps this method) then records
    /// the action. Failures are logged.
    pub async fn observe(&self, event: MutationEvent) {
        if is_read(&event.method) {
            return;
        }
        let kind = signal_for(&event.module, &event.method);
        let entite_id = event.entity_id();

        if let Some(kind) = kind {
            let options = EmitOptions {
                correlation_id: Some(event.correlation_id),
                ..Default::default()
            };
            if let Err(e) = self
                .bus
                .emit_business(kind, &event.module, &entite_id, event.signal_payload(), options)
                .await
            {
                error!("[Middleware] Post-response signal failed: {}", e);
            }
        }

        let category = category_for(kind.map(|k| k.as_str()).unwrap_or(""));
        let mut record = ActionRecord::new(action_for_method(&event.method), category, event.module.clone());
        if let Some(actor) = &event.actor {
            record = record.with_actor(actor);
        }
        record.entite_id = Some(entite_id);
        record.details = event.details();
        record.metadata = json!({ "ip": event.ip, "userAgent": event.user_agent });
        record.correlation_id = Some(event.correlation_id);
        record.duration_ms = Some(event.duration_ms);

        self.hippocampus.record(record).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::relay::LocalRelay;
    use crate::core::signal::ActionCategory;
    use crate::store::{HistoryFilter, MemoryStore, Store};

    fn observer() -> (Arc<MutationObserver>, MemoryStore) {
        let store = MemoryStore::new();
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let bus = SignalBus::new(shared.clone(), Arc::new(LocalRelay::default()));
        (Arc::new(MutationObserver::new(bus, Hippocampus::new(shared))), store)
    }

    fn event(module: &str, method: &str, status: u16) -> MutationEvent {
        MutationEvent {
            module: module.to_string(),
            method: method.to_string(),
            path: "/objectifs".to_string(),
            status,
            path_id: None,
            request_body: Some(json!({"titre": "Objectif 1"})),
            response_body: Some(json!({"success": true, "data": {"id": 42}})),
            actor: Some(Actor {
                user_id: "u1".into(),
                email: "u1@sgg.ga".into(),
                role: "admin_sgg".into(),
            }),
            ip: Some("10.0.0.1".into()),
            user_agent: Some("curl".into()),
            correlation_id: Uuid::new_v4(),
            duration_ms: 12,
        }
    }

    #[test]
    fn methods_map_to_signals_and_actions() {
        assert_eq!(signal_for("nominations", "PATCH"), Some(SignalType::NominationTransition));
        assert_eq!(signal_for("jo", "PUT"), Some(SignalType::JoTexteAjoute));
        assert_eq!(signal_for("jo", "DELETE"), None);
        assert_eq!(signal_for("inconnu", "POST"), None);

        assert_eq!(action_for_method("PATCH"), "MODIFIER");
        assert_eq!(action_for_method("DELETE"), "SUPPRIMER");
        assert_eq!(action_for_method("PURGE"), "PURGE");
        assert!(is_read("OPTIONS"));
        assert!(!is_read("POST"));
    }

    #[test]
    fn entity_id_fallbacks() {
        let mut e = event("gar", "POST", 201);
        assert_eq!(e.entity_id(), "42");

        e.path_id = Some("abc".into());
        assert_eq!(e.entity_id(), "abc");

        e.path_id = None;
        e.response_body = Some(json!({"id": "top"}));
        assert_eq!(e.entity_id(), "top");

        e.response_body = None;
        assert_eq!(e.entity_id(), "");
    }

    #[tokio::test]
    async fn successful_mutation_emits_and_records() {
        let (observer, store) = observer();
        let ev = event("gar", "POST", 201);
        let correlation = ev.correlation_id;
        observer.spawn(ev).await.unwrap();

        let signals = store.pending_signals(10).await.unwrap();
        assert_eq!(signals.len(), 1);
        let signal = &signals[0].signal;
        assert_eq!(signal.kind, SignalType::GarObjectifCree);
        assert_eq!(signal.correlation_id, correlation);
        assert_eq!(signal.entite_id.as_deref(), Some("42"));
        assert_eq!(signal.payload["body"]["titre"], "Objectif 1");

        let (actions, _) = store.list_actions(&HistoryFilter::default(), 10, 0).await.unwrap();
        let record = &actions[0].record;
        assert_eq!(record.action, "CREER");
        assert_eq!(record.categorie, ActionCategory::Metier);
        assert_eq!(record.details["apres"]["titre"], "Objectif 1");
        assert_eq!(record.metadata["ip"], "10.0.0.1");
        assert_eq!(record.duration_ms, Some(12));
        assert_eq!(record.user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn failed_mutation_records_error_without_body() {
        let (observer, store) = observer();
        let mut ev = event("nominations", "DELETE", 404);
        ev.response_body = Some(json!({"error": "Introuvable"}));
        ev.path_id = Some("n-7".into());
        observer.observe(ev).await;

        let signals = store.pending_signals(10).await.unwrap();
        assert!(signals[0].signal.payload.get("body").is_none());

        let (actions, _) = store.list_actions(&HistoryFilter::default(), 10, 0).await.unwrap();
        assert_eq!(actions[0].record.details["erreur"], "Introuvable");
        assert!(actions[0].record.details.get("apres").is_none());
    }

    #[tokio::test]
    async fn unmapped_module_is_only_audited() {
        let (observer, store) = observer();
        observer.observe(event("divers", "PUT", 200)).await;

        assert_eq!(store.count_pending_signals().await.unwrap(), 0);
        let (actions, total) = store.list_actions(&HistoryFilter::default(), 10, 0).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(actions[0].record.categorie, ActionCategory::Metier);
    }

    #[tokio::test]
    async fn reads_are_ignored() {
        let (observer, store) = observer();
        observer.observe(event("gar", "GET", 200)).await;
        let (_, total) = store.list_actions(&HistoryFilter::default(), 10, 0).await.unwrap();
        assert_eq!(total, 0);
    }
}
