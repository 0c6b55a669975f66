use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use coordination::router::{RiskLevel, RouteOutcome};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::roles::RoleError;

/// Errors returned by API handlers.
///
/// The three non-proceed gate outcomes are carried here so handlers can use
/// `?` on them; each maps to its own status and body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request blocked by security gate ({risk_level})")]
    Blocked {
        risk_level: RiskLevel,
        threats: Vec<String>,
    },

    #[error("frontier system required: {reason}")]
    FrontierRequired { reason: String },

    #[error("human review required: {reason}")]
    HumanReview { reason: String },

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Role(#[from] RoleError),
}

impl ApiError {
    /// Convert a non-proceed outcome. `Proceed` has no error form and yields `None`.
    pub fn from_outcome(outcome: RouteOutcome) -> Option<Self> {
        match outcome {
            RouteOutcome::Proceed { .. } => None,
            RouteOutcome::Blocked { risk_level, threats } => Some(Self::Blocked { risk_level, threats }),
            RouteOutcome::RequiresFrontier { reason } => Some(Self::FrontierRequired { reason }),
            RouteOutcome::RequiresHuman { reason } => Some(Self::HumanReview { reason }),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::Blocked { risk_level, threats } => {
                tracing::warn!(risk = %risk_level, threats = ?threats, "Request blocked");
                let body = json!({
                    "error": "security threat detected, operator review required",
                    "risk_level": risk_level,
                    "threats": threats,
                });
                return (StatusCode::FORBIDDEN, Json(body)).into_response();
            }
            ApiError::FrontierRequired { reason } => {
                let body = json!({
                    "error": "frontier system required",
                    "reason": reason,
                });
                return (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response();
            }
            ApiError::HumanReview { reason } => {
                let body = json!({
                    "action": "HUMAN_REVIEW",
                    "reason": reason,
                });
                return (StatusCode::ACCEPTED, Json(body)).into_response();
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Role(err) => {
                tracing::error!("Role error: {:?}", err);
                match err {
                    RoleError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout", err.to_string()),
                    RoleError::Inference { .. } => (StatusCode::BAD_GATEWAY, "inference_error", err.to_string()),
                    RoleError::NoExecutor(_) | RoleError::Residency(_) => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal_error",
                        err.to_string(),
                    ),
                }
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}
