//! # Mutation Layer
//!
//! `route_layer` for business routers: every `POST`/`PUT`/`PATCH`/`DELETE`
//! is timed, its request and JSON response are captured, and a
//! [`MutationEvent`] is handed to the observer once the response is built.
//! The observation runs detached, so the response is never delayed by it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{ConnectInfo, FromRequestParts, Path, Request, State},
    http::{HeaderMap, StatusCode, header, request::Parts},
    middleware::{Next, from_fn_with_state},
    response::{IntoResponse, Response},
};
use neocortex::core::middleware::{MutationEvent, MutationObserver, is_read};
use neocortex::new_correlation_id;
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use super::auth::actor_from_headers;

/// Largest request or response body captured.
pub const MAX_CAPTURED_BODY: usize = 2 * 1024 * 1024;

/// Correlation id of the observed mutation, available to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationId(pub Uuid);

/// Layer state: which business module the router serves.
#[derive(Clone)]
pub struct ObservedModule {
    observer: Arc<MutationObserver>,
    module: Arc<str>,
}

/// Observes every mutation routed by `router` as belonging to `module`.
pub fn observe_module<S>(router: Router<S>, module: &str, observer: Arc<MutationObserver>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let observed = ObservedModule {
        observer,
        module: Arc::from(module),
    };
    router.route_layer(from_fn_with_state(observed, observe_mutation))
}

fn client_ip(parts: &Parts) -> Option<String> {
    if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip().to_string());
    }
    parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}

fn parse_json(bytes: &Bytes) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    serde_json::from_slice(bytes).ok()
}

pub async fn observe_mutation(State(observed): State<ObservedModule>, request: Request, next: Next) -> Response {
    if is_read(request.method().as_str()) {
        return next.run(request).await;
    }

    let started = Instant::now();
    let correlation_id = new_correlation_id();
    let (mut parts, body) = request.into_parts();

    let path_id = Path::<HashMap<String, String>>::from_request_parts(&mut parts, &())
        .await
        .ok()
        .and_then(|Path(params)| params.get("id").cloned());
    let method = parts.method.as_str().to_string();
    let path = parts.uri.path().to_string();
    let actor = actor_from_headers(&parts.headers);
    let ip = client_ip(&parts);
    let user_agent = parts
        .headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let request_bytes = match axum::body::to_bytes(body, MAX_CAPTURED_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("[Middleware] Request body rejected: {}", e);
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "error": "Corps de requête trop volumineux" })),
            )
                .into_response();
        }
    };
    let request_body = parse_json(&request_bytes);

    parts.extensions.insert(CorrelationId(correlation_id));
    let response = next.run(Request::from_parts(parts, Body::from(request_bytes))).await;

    let status = response.status().as_u16();
    let (response, response_body) = if is_json(response.headers()) {
        let (res_parts, res_body) = response.into_parts();
        match axum::body::to_bytes(res_body, MAX_CAPTURED_BODY).await {
            Ok(bytes) => {
                let captured = parse_json(&bytes);
                (Response::from_parts(res_parts, Body::from(bytes)), captured)
            }
            Err(e) => {
                warn!("[Middleware] Response body not captured: {}", e);
                (Response::from_parts(res_parts, Body::empty()), None)
            }
        }
    } else {
        (response, None)
    };

    observed.observer.spawn(MutationEvent {
        module: observed.module.to_string(),
        method,
        path,
        status,
        path_id,
        request_body,
        response_body,
        actor,
        ip,
        user_agent,
        correlation_id,
        duration_ms: started.elapsed().as_millis() as i64,
    });

    response
}
