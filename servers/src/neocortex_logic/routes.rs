//! # HTTP API
//!
//! Dashboard, backlog, audit trail, configuration, decisions, notifications,
//! adaptive weights and metrics under `/api/neocortex`, plus `/health`.
//!
//! Successful responses are wrapped as `{"success": true, "data": ...}`.

use std::str::FromStr;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    routing::{get, patch, post},
};
use chrono::{DateTime, NaiveDate, Utc};
use neocortex::core::auditory::ListOptions;
use neocortex::core::hippocampus::{self, HistoryQuery};
use neocortex::core::prefrontal::{ApprovalCriteria, validate_transition};
use neocortex::store::{HistoryFilter, MetricQuery};
use neocortex::{ActionCategory, NotificationKind};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use super::auth::{AdminUser, CurrentUser, SuperAdmin};
use super::error::AppError;
use super::state::AppState;

pub const SIGNALS_DEFAULT_LIMIT: usize = 50;
pub const SIGNALS_MAX_LIMIT: usize = 200;
pub const METRICS_DEFAULT_LIMIT: usize = 100;
pub const METRICS_MAX_LIMIT: usize = 500;

type ApiResult = Result<Json<Value>, AppError>;

fn success<T: Serialize>(data: T) -> ApiResult {
    Ok(Json(json!({ "success": true, "data": data })))
}

/// Lenient positive integer: absent, malformed or zero reads as `None`.
fn positive(raw: &Option<String>) -> Option<usize> {
    raw.as_deref()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.filter(|v| !v.trim().is_empty())
}

/// RFC 3339 timestamp or plain `YYYY-MM-DD` (midnight UTC).
fn parse_date(field: &str, raw: Option<String>) -> Result<Option<DateTime<Utc>>, AppError> {
    let Some(raw) = non_empty(raw) else {
        return Ok(None);
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Some(dt.and_utc()))
        .ok_or_else(|| AppError::BadRequest(format!("{} invalide", field)))
}

fn json_body(body: Result<Json<Value>, JsonRejection>) -> Result<Value, AppError> {
    body.map(|Json(v)| v)
        .map_err(|rejection| AppError::BadRequest(rejection.body_text()))
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/dashboard", get(dashboard))
        .route("/signaux", get(list_signals))
        .route("/historique", get(list_history))
        .route("/historique/{entite_type}/{entite_id}", get(entity_timeline))
        .route("/config", get(list_configs))
        .route("/config/{cle}", get(read_config).put(write_config))
        .route("/decision/transition/validate", post(check_transition))
        .route("/decision/auto-approbation", post(auto_approval))
        .route("/notifications", get(list_notifications))
        .route("/notifications/count", get(count_unread))
        .route("/notifications/lire-tout", patch(mark_all_read))
        .route("/notifications/{id}/lue", patch(mark_read))
        .route("/poids/{signal_type}", get(adaptive_weights))
        .route("/metriques", get(list_metrics));

    Router::new()
        .route("/health", get(health))
        .nest("/api/neocortex", api)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> ApiResult {
    state
        .neocortex
        .store()
        .ping()
        .await
        .map_err(|e| AppError::Unavailable(e.to_string()))?;
    Ok(Json(json!({
        "status": "ok",
        "store": "up",
        "clock": state.neocortex.circadian().is_running().await,
        "uptimeSecs": state.uptime_secs(),
    })))
}

// ============================================================================
// Dashboard & backlog
// ============================================================================

async fn dashboard(State(state): State<AppState>, _admin: AdminUser) -> ApiResult {
    let n = &state.neocortex;
    let (limbique, hippocampe, moteur) = tokio::try_join!(n.bus().stats(), n.hippocampus().stats(), n.motor().stats())?;
    success(json!({
        "limbique": limbique,
        "hippocampe": hippocampe,
        "moteur": moteur,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<String>,
}

async fn list_signals(State(state): State<AppState>, _admin: AdminUser, Query(q): Query<LimitQuery>) -> ApiResult {
    let limit = positive(&q.limit).unwrap_or(SIGNALS_DEFAULT_LIMIT).min(SIGNALS_MAX_LIMIT);
    success(state.neocortex.bus().list_unprocessed(limit).await?)
}

// ============================================================================
// Audit trail
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryParams {
    entite_type: Option<String>,
    entite_id: Option<String>,
    user_id: Option<String>,
    categorie: Option<String>,
    action: Option<String>,
    date_debut: Option<String>,
    date_fin: Option<String>,
    page: Option<String>,
    limit: Option<String>,
}

async fn list_history(State(state): State<AppState>, _admin: AdminUser, Query(q): Query<HistoryParams>) -> ApiResult {
    let categorie = non_empty(q.categorie)
        .map(|c| ActionCategory::from_str(&c))
        .transpose()?;
    let query = HistoryQuery {
        filter: HistoryFilter {
            entite_type: non_empty(q.entite_type),
            entite_id: non_empty(q.entite_id),
            user_id: non_empty(q.user_id),
            categorie,
            action: non_empty(q.action),
            date_debut: parse_date("dateDebut", q.date_debut)?,
            date_fin: parse_date("dateFin", q.date_fin)?,
        },
        page: positive(&q.page),
        limit: positive(&q.limit),
    };
    success(state.neocortex.hippocampus().list(&query).await?)
}

async fn entity_timeline(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path((entite_type, entite_id)): Path<(String, String)>,
) -> ApiResult {
    let timeline = state
        .neocortex
        .hippocampus()
        .entity_timeline(&entite_type, &entite_id, hippocampus::DEFAULT_PAGE_SIZE)
        .await?;
    success(timeline)
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Deserialize)]
struct CategoryQuery {
    categorie: Option<String>,
}

async fn list_configs(State(state): State<AppState>, _admin: AdminUser, Query(q): Query<CategoryQuery>) -> ApiResult {
    let categorie = non_empty(q.categorie);
    success(state.neocortex.plasticity().list(categorie.as_deref()).await?)
}

async fn read_config(State(state): State<AppState>, _user: CurrentUser, Path(cle): Path<String>) -> ApiResult {
    match state.neocortex.plasticity().read(&cle).await? {
        Some(valeur) => success(json!({ "cle": cle, "valeur": valeur })),
        None => Err(AppError::NotFound("Configuration non trouvée".to_string())),
    }
}

async fn write_config(
    State(state): State<AppState>,
    SuperAdmin(user): SuperAdmin,
    Path(cle): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let body = json_body(body)?;
    let Some(valeur) = body.get("valeur").cloned() else {
        return Err(AppError::BadRequest("valeur est requis".to_string()));
    };
    let description = body.get("description").and_then(Value::as_str);
    state
        .neocortex
        .plasticity()
        .write(&cle, &valeur, Some(user.user_id()), description)
        .await?;
    success(json!({ "cle": cle, "valeur": valeur }))
}

// ============================================================================
// Decisions
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransitionBody {
    module: Option<String>,
    statut_actuel: Option<String>,
    nouveau_statut: Option<String>,
}

async fn check_transition(_user: CurrentUser, body: Result<Json<Value>, JsonRejection>) -> ApiResult {
    let body: TransitionBody = serde_json::from_value(json_body(body)?).unwrap_or_default();
    let (Some(module), Some(from), Some(to)) = (
        non_empty(body.module),
        non_empty(body.statut_actuel),
        non_empty(body.nouveau_statut),
    ) else {
        return Err(AppError::BadRequest("module, statutActuel et nouveauStatut requis".to_string()));
    };
    success(validate_transition(&module, &from, &to))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalBody {
    module: Option<String>,
    entite_id: Option<Value>,
    completude: Option<f64>,
    delai: Option<f64>,
    historique: Option<f64>,
    conformite: Option<f64>,
    urgence: Option<f64>,
}

async fn auto_approval(
    State(state): State<AppState>,
    user: CurrentUser,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult {
    let body: ApprovalBody = serde_json::from_value(json_body(body)?).unwrap_or_default();
    let entite_id = body.entite_id.and_then(|v| match v {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    let (Some(module), Some(entite_id), Some(completude), Some(conformite)) =
        (non_empty(body.module), entite_id, body.completude, body.conformite)
    else {
        return Err(AppError::BadRequest("module, entiteId, completude et conformite requis".to_string()));
    };

    let criteria = ApprovalCriteria {
        completude,
        delai: body.delai.unwrap_or(1.0),
        historique: body.historique.unwrap_or(0.5),
        conformite,
        urgence: body.urgence,
    };
    let result = state
        .neocortex
        .prefrontal()
        .evaluate_auto_approval(&module, &entite_id, &criteria, Some(user.user_id()))
        .await?;
    success(result)
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationParams {
    non_lues: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
}

async fn list_notifications(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(q): Query<NotificationParams>,
) -> ApiResult {
    let kind = non_empty(q.kind)
        .map(|k| NotificationKind::from_str(&k))
        .transpose()?;
    let options = ListOptions {
        non_lues_seulement: q.non_lues.as_deref() == Some("true"),
        kind,
        limit: positive(&q.limit),
        offset: positive(&q.offset),
    };
    success(state.neocortex.auditory().list(user.user_id(), &options).await?)
}

async fn count_unread(State(state): State<AppState>, user: CurrentUser) -> ApiResult {
    let count = state.neocortex.auditory().count_unread(user.user_id()).await?;
    success(json!({ "nonLues": count }))
}

async fn mark_read(State(state): State<AppState>, user: CurrentUser, Path(id): Path<String>) -> ApiResult {
    let not_found = || AppError::NotFound("Notification non trouvée".to_string());
    let id = Uuid::parse_str(&id).map_err(|_| not_found())?;
    if !state.neocortex.auditory().mark_read(id, user.user_id()).await? {
        return Err(not_found());
    }
    Ok(Json(json!({ "success": true })))
}

async fn mark_all_read(State(state): State<AppState>, user: CurrentUser) -> ApiResult {
    let count = state.neocortex.auditory().mark_all_read(user.user_id()).await?;
    success(json!({ "marquees": count }))
}

// ============================================================================
// Weights & metrics
// ============================================================================

async fn adaptive_weights(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(signal_type): Path<String>,
) -> ApiResult {
    success(state.neocortex.plasticity().weights(&signal_type).await?)
}

#[derive(Debug, Deserialize)]
struct MetricParams {
    nom: Option<String>,
    periode: Option<String>,
    limit: Option<String>,
}

async fn list_metrics(State(state): State<AppState>, _admin: AdminUser, Query(q): Query<MetricParams>) -> ApiResult {
    let query = MetricQuery {
        nom: non_empty(q.nom),
        periode: non_empty(q.periode),
        limit: positive(&q.limit).unwrap_or(METRICS_DEFAULT_LIMIT).min(METRICS_MAX_LIMIT),
    };
    success(state.neocortex.store().list_metrics(&query).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use neocortex::configs::NeocortexSettings;
    use neocortex::core::relay::LocalRelay;
    use neocortex::store::MemoryStore;
    use neocortex::{Metric, Neocortex, Notification, NotificationChannel};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> (Router, Neocortex) {
        let n = Neocortex::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalRelay::default()),
            NeocortexSettings::default(),
        );
        (router(AppState::new(n.clone())), n)
    }

    fn request(method: &str, uri: &str, role: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(role) = role {
            builder = builder
                .header("x-user-id", "u1")
                .header("x-user-email", "u1@sgg.ga")
                .header("x-user-role", role);
        }
        match body {
            Some(b) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn notification(user_id: &str, titre: &str) -> Notification {
        Notification {
            user_id: user_id.to_string(),
            kind: NotificationKind::Info,
            canal: NotificationChannel::InApp,
            titre: titre.to_string(),
            message: "Un dossier attend votre validation".to_string(),
            lien: None,
            entite_type: None,
            entite_id: None,
            signal_id: None,
            expire_at: None,
        }
    }

    #[tokio::test]
    async fn identity_and_roles_are_enforced() {
        let (app, _) = app();

        let (status, body) = call(&app, request("GET", "/api/neocortex/notifications/count", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Authentification requise");

        let (status, body) = call(&app, request("GET", "/api/neocortex/dashboard", Some("agent"), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Accès réservé aux administrateurs");

        let put = request("PUT", "/api/neocortex/config/signal.batch_size", Some("directeur_sgg"), Some(json!({"valeur": 10})));
        let (status, body) = call(&app, put).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Réservé au super administrateur");
    }

    #[tokio::test]
    async fn config_write_then_read() {
        let (app, n) = app();

        let (status, body) = call(&app, request("GET", "/api/neocortex/config/signal.batch_size", Some("agent"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Configuration non trouvée");

        let missing = request("PUT", "/api/neocortex/config/signal.batch_size", Some("admin_sgg"), Some(json!({"description": "x"})));
        let (status, body) = call(&app, missing).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "valeur est requis");

        let put = request(
            "PUT",
            "/api/neocortex/config/signal.batch_size",
            Some("admin_sgg"),
            Some(json!({"valeur": 25, "description": "Signaux par cycle"})),
        );
        let (status, body) = call(&app, put).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "data": {"cle": "signal.batch_size", "valeur": 25}}));

        let (_, body) = call(&app, request("GET", "/api/neocortex/config/signal.batch_size", Some("agent"), None)).await;
        assert_eq!(body["data"]["valeur"], 25);

        let entry = n.store().get_config("signal.batch_size").await.unwrap().unwrap();
        assert_eq!(entry.modifie_par.as_deref(), Some("u1"));

        let (status, body) = call(&app, request("GET", "/api/neocortex/config?categorie=signal", Some("directeur_sgg"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transition_validation() {
        let (app, _) = app();
        let body = json!({"module": "nomination", "statutActuel": "brouillon", "nouveauStatut": "soumis_sg"});
        let (status, body) = call(&app, request("POST", "/api/neocortex/decision/transition/validate", Some("agent"), Some(body))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["autorise"], true);
        assert_eq!(body["data"]["transitionsValides"], json!(["soumis_sg"]));

        let partial = json!({"module": "nomination"});
        let (status, body) = call(&app, request("POST", "/api/neocortex/decision/transition/validate", Some("agent"), Some(partial))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "module, statutActuel et nouveauStatut requis");
    }

    #[tokio::test]
    async fn auto_approval_defaults_and_validation() {
        let (app, n) = app();
        let body = json!({"module": "nomination", "entiteId": 12, "completude": 1.0, "conformite": 1.0});
        let (status, body) = call(&app, request("POST", "/api/neocortex/decision/auto-approbation", Some("agent"), Some(body))).await;
        assert_eq!(status, StatusCode::OK);
        // (3 + 2 + 2*0.5 + 4) / 11
        assert_eq!(body["data"]["score"], 0.9091);
        assert_eq!(body["data"]["decision"], "approve");

        let (_, total) = n.store().list_actions(&HistoryFilter::default(), 10, 0).await.unwrap();
        assert_eq!(total, 1);

        let missing = json!({"module": "nomination", "entiteId": "n-1", "completude": 0.5});
        let (status, _) = call(&app, request("POST", "/api/neocortex/decision/auto-approbation", Some("agent"), Some(missing))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn notification_inbox() {
        let (app, n) = app();
        let first = n.auditory().create(&notification("u1", "Premier")).await.unwrap();
        n.auditory().create(&notification("u1", "Second")).await.unwrap();
        n.auditory().create(&notification("u2", "Autre")).await.unwrap();

        let (_, body) = call(&app, request("GET", "/api/neocortex/notifications/count", Some("agent"), None)).await;
        assert_eq!(body["data"]["nonLues"], 2);

        let uri = format!("/api/neocortex/notifications/{}/lue", first);
        let (status, body) = call(&app, request("PATCH", &uri, Some("agent"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true}));

        let (_, body) = call(&app, request("GET", "/api/neocortex/notifications?nonLues=true", Some("agent"), None)).await;
        assert_eq!(body["data"]["notifications"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"]["totalNonLues"], 1);

        let (status, _) = call(&app, request("PATCH", "/api/neocortex/notifications/pas-un-uuid/lue", Some("agent"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(&app, request("PATCH", "/api/neocortex/notifications/lire-tout", Some("agent"), None)).await;
        assert_eq!(body["data"]["marquees"], 1);

        let (status, _) = call(&app, request("GET", "/api/neocortex/notifications?type=inconnu", Some("agent"), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn backlog_history_and_metrics() {
        let (app, n) = app();
        n.observer()
            .observe(neocortex::core::middleware::MutationEvent {
                module: "nominations".into(),
                method: "POST".into(),
                path: "/".into(),
                status: 201,
                path_id: Some("n-1".into()),
                request_body: None,
                response_body: None,
                actor: None,
                ip: None,
                user_agent: None,
                correlation_id: Uuid::new_v4(),
                duration_ms: 3,
            })
            .await;
        n.store()
            .insert_metrics(&[Metric::count("signaux_non_traites", 1, "minute")])
            .await
            .unwrap();

        let (_, body) = call(&app, request("GET", "/api/neocortex/signaux?limit=abc", Some("admin_sgg"), None)).await;
        assert_eq!(body["data"]["total"], 1);

        let (_, body) = call(&app, request("GET", "/api/neocortex/historique?categorie=METIER&dateDebut=2020-01-01", Some("admin_sgg"), None)).await;
        assert_eq!(body["data"]["total"], 1);
        assert_eq!(body["data"]["page"], 1);

        let (status, _) = call(&app, request("GET", "/api/neocortex/historique?categorie=AUTRE", Some("admin_sgg"), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&app, request("GET", "/api/neocortex/historique/nominations/n-1", Some("agent"), None)).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (_, body) = call(&app, request("GET", "/api/neocortex/metriques?nom=signaux_non_traites", Some("admin_sgg"), None)).await;
        assert_eq!(body["data"][0]["valeur"], 1.0);

        let (status, body) = call(&app, request("GET", "/api/neocortex/dashboard", Some("directeur_sgg"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["limbique"]["nonTraites"], 1);
        assert!(body["data"]["timestamp"].is_string());

        let (status, body) = call(&app, request("GET", "/api/neocortex/poids/NOMINATION_CREEE", Some("admin_sgg"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!([]));
    }

    #[test]
    fn lenient_params() {
        assert_eq!(positive(&Some("0".into())), None);
        assert_eq!(positive(&Some(" 12 ".into())), Some(12));
        assert_eq!(positive(&Some("-3".into())), None);
        assert!(parse_date("dateFin", Some("2024-13-01".into())).is_err());
        assert_eq!(
            parse_date("dateFin", Some("2024-03-01T10:00:00+01:00".into())).unwrap().map(|d| d.to_rfc3339()),
            Some("2024-03-01T09:00:00+00:00".to_string())
        );
    }

    #[tokio::test]
    async fn health_reports_store() {
        let (app, _) = app();
        let (status, body) = call(&app, request("GET", "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["clock"], false);
    }
}
