use crate::provider::ProviderError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Errors surfaced on the control-plane HTTP API.
///
/// Control failures stay distinguishable so agents know whether a retry
/// can help: a gone endpoint ("call already ended") is final, an
/// unresolved endpoint ("call never connected") is final, a transient
/// provider fault is worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden".to_string()),
            ApiError::Provider(err) => match err {
                ProviderError::InvalidDestination(msg) => {
                    (StatusCode::BAD_REQUEST, format!("invalid destination: {}", msg))
                }
                ProviderError::ControlEndpointGone => (
                    StatusCode::GONE,
                    "call already ended, control channel is gone".to_string(),
                ),
                ProviderError::NoControlEndpoint => (
                    StatusCode::CONFLICT,
                    "call never connected, no control channel available".to_string(),
                ),
                ProviderError::ControlEndpointUnavailable(_) => (
                    StatusCode::GATEWAY_TIMEOUT,
                    "control channel unreachable, retry may help".to_string(),
                ),
                ProviderError::Unavailable(_) => (
                    StatusCode::BAD_GATEWAY,
                    "voice provider unavailable".to_string(),
                ),
            },
            ApiError::Internal(err) => {
                tracing::error!("internal error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "success": false,
            "error": message,
        }));
        (status, body).into_response()
    }
}
