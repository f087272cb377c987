//! # End-to-end Flows
//!
//! Drives the whole nervous system through its facade against the in-memory
//! store and relay: signal routing, tasks, workflows, configuration and
//! notifications, plus the HTTP mutation layer on a business router.

use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router};
use axum::body::Body;
use axum::extract::Path;
use axum::http::{Request, StatusCode, header};
use axum::routing::put;
use neocortex::configs::NeocortexSettings;
use neocortex::core::auditory::NotifyOptions;
use neocortex::core::limbic::EmitOptions;
use neocortex::core::relay::LocalRelay;
use neocortex::store::{HistoryFilter, MemoryStore};
use neocortex::{
    ActionCategory, Actor, CortexModule, Neocortex, NeocortexError, NotificationKind, SignalType, TaskRequest,
};
use serde_json::json;
use servers::neocortex_logic::middleware::observe_module;
use tokio::time::timeout;
use tower::ServiceExt;

fn system() -> (Neocortex, MemoryStore) {
    let store = MemoryStore::new();
    let neocortex = Neocortex::new(
        Arc::new(store.clone()),
        Arc::new(LocalRelay::default()),
        NeocortexSettings::default(),
    );
    (neocortex, store)
}

fn actor() -> Actor {
    Actor {
        user_id: "u-42".to_string(),
        email: "agent@sgg.ga".to_string(),
        role: "directeur_sgg".to_string(),
    }
}

#[tokio::test]
async fn critical_signal_is_routed_without_waiting_for_the_batch() {
    let (n, _) = system();
    let mut monitoring = n.bus().subscribe(CortexModule::Monitoring);

    let id = n
        .bus()
        .emit_business(
            SignalType::SecuriteBruteForce,
            "utilisateur",
            "u-7",
            json!({ "tentatives": 12 }),
            EmitOptions::default(),
        )
        .await
        .unwrap();

    let routed = timeout(Duration::from_secs(2), monitoring.recv())
        .await
        .expect("critical signal not routed")
        .unwrap();
    assert_eq!(routed.signal_id, id);
    assert_eq!(routed.kind, SignalType::SecuriteBruteForce);
    assert_eq!(routed.payload["tentatives"], 12);
    assert_eq!(n.store().count_pending_signals().await.unwrap(), 0);
}

#[tokio::test]
async fn batch_routing_serves_urgent_signals_first() {
    let (n, _) = system();
    let mut hippocampe = n.bus().subscribe(CortexModule::Hippocampe);

    n.bus()
        .emit_business(SignalType::GarObjectifCree, "gar", "g-1", json!({}), EmitOptions::default())
        .await
        .unwrap();
    n.bus()
        .emit_business(SignalType::NominationTransition, "nomination", "n-1", json!({}), EmitOptions::default())
        .await
        .unwrap();

    assert_eq!(n.circadian().route_tick().await, 2);

    let first = hippocampe.recv().await.unwrap();
    let second = hippocampe.recv().await.unwrap();
    assert_eq!(first.kind, SignalType::NominationTransition);
    assert_eq!(second.kind, SignalType::GarObjectifCree);
    assert_eq!(n.store().count_pending_signals().await.unwrap(), 0);
}

#[tokio::test]
async fn failing_task_retries_then_signals_final_failure() {
    let (n, _) = system();
    n.motor().register_handler("SYNC_ANNUAIRE", |_payload| async move {
        Err(NeocortexError::Handler("annuaire injoignable".to_string()))
    });

    let mut retried = TaskRequest::new("SYNC_ANNUAIRE", json!({ "source": "rh" }));
    retried.max_tentatives = Some(2);
    n.motor().create_task(retried).await.unwrap();

    let report = n.motor().process_pending(10).await.unwrap();
    assert_eq!((report.traitees, report.echouees), (1, 1));
    // Back-off keeps the task out of the next cycle.
    assert_eq!(n.motor().process_pending(10).await.unwrap().traitees, 0);
    assert_eq!(n.motor().stats().await.unwrap().en_attente, 1);

    let mut once = TaskRequest::new("SYNC_ANNUAIRE", json!({}));
    once.max_tentatives = Some(1);
    n.motor().create_task(once).await.unwrap();
    n.motor().process_pending(10).await.unwrap();

    let pending = n.bus().list_unprocessed(10).await.unwrap();
    assert_eq!(pending.total, 1);
    assert_eq!(pending.signaux[0].kind, SignalType::TacheEchouee);
    assert_eq!(pending.signaux[0].entite_type.as_deref(), Some("tache_async"));
}

#[tokio::test]
async fn task_without_handler_fails_immediately() {
    let (n, _) = system();
    n.motor()
        .create_task(TaskRequest::new("TYPE_INCONNU", json!({})))
        .await
        .unwrap();

    let report = n.motor().process_pending(10).await.unwrap();
    assert_eq!(report.echouees, 1);
    let stats = n.motor().stats().await.unwrap();
    assert_eq!(stats.en_attente, 0);
    assert_eq!(stats.echouees24h, 1);
}

#[tokio::test]
async fn workflow_transitions_are_signalled_and_audited() {
    let (n, _) = system();
    let prefrontal = n.prefrontal();

    let ok = prefrontal
        .execute_transition("nomination", "n-9", "brouillon", "soumis_sg", &actor(), Some("RAS"))
        .await
        .unwrap();
    assert!(ok.succes);

    let refused = prefrontal
        .execute_transition("nomination", "n-9", "brouillon", "signe", &actor(), None)
        .await
        .unwrap();
    assert!(!refused.succes);
    assert!(refused.message.contains("soumis_sg"));

    let pending = n.bus().list_unprocessed(10).await.unwrap();
    assert_eq!(pending.total, 1);
    assert_eq!(pending.signaux[0].kind, SignalType::NominationTransition);

    let timeline = n.hippocampus().entity_timeline("nomination", "n-9", 50).await.unwrap();
    assert_eq!(timeline.len(), 2);
    let security = HistoryFilter {
        categorie: Some(ActionCategory::Securite),
        ..Default::default()
    };
    let (refusals, total) = n.store().list_actions(&security, 10, 0).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(refusals[0].record.action, "TRANSITION_REFUSEE");
    assert_eq!(refusals[0].record.user_email.as_deref(), Some("agent@sgg.ga"));
}

#[tokio::test]
async fn config_write_invalidates_cached_value() {
    let (n, _) = system();
    n.seed_defaults().await.unwrap();

    let before: u64 = n.plasticity().read_or("moteur.max_concurrent_tasks", 0).await;
    assert_eq!(before, 10);

    let entry = n
        .plasticity()
        .write("moteur.max_concurrent_tasks", &json!(4), Some("u-42"), None)
        .await
        .unwrap();
    assert_eq!(entry.version, 2);
    assert_eq!(entry.categorie.as_deref(), Some("moteur"));

    let after: u64 = n.plasticity().read_or("moteur.max_concurrent_tasks", 0).await;
    assert_eq!(after, 4);
}

#[tokio::test]
async fn role_notifications_reach_active_users_only() {
    let (n, store) = system();
    store.add_user("d-1", "directeur_sgg", true);
    store.add_user("d-2", "directeur_sgg", false);
    store.add_user("a-1", "agent", true);

    let sent = n
        .auditory()
        .notify_role(
            "directeur_sgg",
            NotificationKind::Action,
            "Nomination à valider",
            "Le dossier n-9 attend votre avis",
            &NotifyOptions {
                lien: Some("/nominations/n-9".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(sent, 1);

    assert_eq!(n.auditory().count_unread("d-1").await.unwrap(), 1);
    assert_eq!(n.auditory().count_unread("d-2").await.unwrap(), 0);
    assert_eq!(n.auditory().mark_all_read("d-1").await.unwrap(), 1);
    assert_eq!(n.auditory().count_unread("d-1").await.unwrap(), 0);
}

#[tokio::test]
async fn health_tick_writes_backlog_metrics() {
    let (n, _) = system();
    n.bus()
        .emit_business(SignalType::JoTexteAjoute, "jo", "jo-1", json!({}), EmitOptions::default())
        .await
        .unwrap();

    let snapshot = n.circadian().health_tick().await.unwrap();
    assert_eq!(snapshot.signaux_non_traites, 1);
}

#[tokio::test]
async fn business_router_mutations_are_signalled_and_audited() {
    let (n, _) = system();
    let nominations = Router::new().route(
        "/nominations/{id}",
        put(|Path(id): Path<String>| async move { Json(json!({ "success": true, "data": { "id": id } })) }),
    );
    let app = observe_module(nominations, "nominations", n.observer().clone());

    let response = app
        .oneshot(
            Request::put("/nominations/n-12")
                .header(header::CONTENT_TYPE, "application/json")
                .header("x-user-id", "u-42")
                .header("x-user-email", "agent@sgg.ga")
                .header("x-user-role", "directeur_sgg")
                .body(Body::from(r#"{"poste":"Secrétaire général"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut timeline = Vec::new();
    for _ in 0..50 {
        timeline = n.hippocampus().entity_timeline("nominations", "n-12", 10).await.unwrap();
        if !timeline.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].record.action, "MODIFIER");
    assert_eq!(timeline[0].record.user_email.as_deref(), Some("agent@sgg.ga"));
    assert_eq!(timeline[0].record.details["apres"]["poste"], "Secrétaire général");

    let pending = n.bus().list_unprocessed(10).await.unwrap();
    assert_eq!(pending.total, 1);
    assert_eq!(pending.signaux[0].kind, SignalType::NominationModifiee);
    assert_eq!(pending.signaux[0].entite_type.as_deref(), Some("nominations"));
}
