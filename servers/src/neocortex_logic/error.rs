//! # API Errors
//!
//! Every handler returns `Result<_, AppError>`. The body is always
//! `{"error": "<message>"}`; internal failures are logged and reported as
//! `Erreur serveur` without details.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use neocortex::NeocortexError;
use serde_json::json;
use tracing::{error, warn};

pub const MSG_UNAUTHENTICATED: &str = "Authentification requise";
pub const MSG_ADMIN_ONLY: &str = "Accès réservé aux administrateurs";
pub const MSG_SUPER_ADMIN_ONLY: &str = "Réservé au super administrateur";
pub const MSG_INTERNAL: &str = "Erreur serveur";

#[derive(Debug)]
pub enum AppError {
    /// No identity on the request.
    Unauthorized,
    /// Identity present but the role is not allowed.
    Forbidden(&'static str),
    BadRequest(String),
    NotFound(String),
    /// Failure of the nervous system itself.
    Internal(NeocortexError),
    /// Backend unreachable (health check).
    Unavailable(String),
}

impl From<NeocortexError> for AppError {
    fn from(e: NeocortexError) -> Self {
        match e {
            NeocortexError::InvalidInput(msg) => AppError::BadRequest(msg),
            NeocortexError::NotFound(msg) => AppError::NotFound(msg),
            other => AppError::Internal(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, MSG_UNAUTHENTICATED.to_string()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.to_string()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(e) => {
                error!("[NEOCORTEX Route] {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, MSG_INTERNAL.to_string())
            }
            AppError::Unavailable(detail) => {
                warn!("[NEOCORTEX Route] health check failed: {}", detail);
                (StatusCode::SERVICE_UNAVAILABLE, "Service indisponible".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Unauthorized => write!(f, "{}", MSG_UNAUTHENTICATED),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Internal(e) => write!(f, "Internal error: {}", e),
            AppError::Unavailable(detail) => write!(f, "Unavailable: {}", detail),
        }
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_errors_map_to_statuses() {
        let cases = [
            (NeocortexError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (NeocortexError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (NeocortexError::Store("down".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn internal_errors_hide_details() {
        let response = AppError::Internal(NeocortexError::Store("secret dsn".into())).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({ "error": MSG_INTERNAL }));
    }
}
