//! Error taxonomy and the upstream-compatible failure bodies.
//!
//! Policy violations and conflicts are terminal HTTP errors with stable
//! codes. Transient storage errors on non-critical paths never reach this
//! type; they are logged where they happen and the request proceeds.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing X-Switchboard-Token header")]
    MissingToken,

    #[error("unknown or inactive token")]
    InvalidToken,

    #[error("agent is {0}")]
    AgentSuspended(&'static str),

    #[error("blocked by firewall: {0}")]
    PolicyViolation(String),

    #[error("resource locked")]
    ResourceLocked,

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("emergency stop engaged")]
    EmergencyStop,

    #[error("{0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, code) = match &self {
            AppError::MissingToken | AppError::InvalidToken => {
                (StatusCode::UNAUTHORIZED, "validation_error", "MISSING_TOKEN")
            }
            AppError::AgentSuspended(_) => {
                (StatusCode::FORBIDDEN, "policy_violation", "AGENT_SUSPENDED")
            }
            AppError::PolicyViolation(_) => (
                StatusCode::FORBIDDEN,
                "policy_violation",
                "BLOCKED_BY_FIREWALL",
            ),
            AppError::ResourceLocked => {
                (StatusCode::CONFLICT, "conflict_error", "RESOURCE_LOCKED")
            }
            AppError::Upstream(_) => (StatusCode::BAD_GATEWAY, "proxy_error", "UPSTREAM_FAILED"),
            AppError::EmergencyStop => (
                StatusCode::SERVICE_UNAVAILABLE,
                "emergency_error",
                "EMERGENCY_STOP",
            ),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "validation_error", "BAD_REQUEST"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", "NOT_FOUND"),
            AppError::Internal(e) => {
                tracing::error!("internal error: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "INTERNAL",
                )
            }
        };

        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": kind,
                "code": code,
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_violation_maps_to_403() {
        let resp = AppError::PolicyViolation("pii detected".into()).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_conflict_maps_to_409() {
        let resp = AppError::ResourceLocked.into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_emergency_maps_to_503() {
        let resp = AppError::EmergencyStop.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
