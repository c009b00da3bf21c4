//! Error taxonomy for the dispatch core.
//!
//! Every operation surfaces one of these variants. The HTTP layer maps them to
//! status codes through [`IntoResponse`].

use axum::{
    Json, extract::rejection::JsonRejection, http::StatusCode, response::IntoResponse,
};
use serde_json::json;

use crate::model::AlertStatus;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Malformed or missing input. Never retried automatically.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The transition is not allowed from the current state, including the
    /// losing side of a CAS race. Informational, not retryable.
    #[error("{0}")]
    StateConflict(String),

    /// The caller asked for an edge that is not in the lifecycle graph.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: AlertStatus, to: AlertStatus },

    /// The actor is not allowed to issue this command.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A dependency did not answer in time. Eligible for bounded retry.
    #[error("{0} did not respond in time")]
    DependencyTimeout(&'static str),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl DispatchError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        DispatchError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Conflict raised against an alert that already reached `status`.
    pub fn already(status: AlertStatus) -> Self {
        DispatchError::StateConflict(format!("already {status}"))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::DependencyTimeout(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            DispatchError::Validation(_) => "validation_error",
            DispatchError::NotFound { .. } => "not_found",
            DispatchError::StateConflict(_) => "state_conflict",
            DispatchError::InvalidTransition { .. } => "invalid_transition",
            DispatchError::Forbidden(_) => "forbidden",
            DispatchError::DependencyTimeout(_) => "dependency_timeout",
            DispatchError::Storage(_) => "internal_error",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
            DispatchError::NotFound { .. } => StatusCode::NOT_FOUND,
            DispatchError::StateConflict(_) => StatusCode::CONFLICT,
            DispatchError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            DispatchError::Forbidden(_) => StatusCode::FORBIDDEN,
            DispatchError::DependencyTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A body that does not parse into the expected shape is malformed input.
impl From<JsonRejection> for DispatchError {
    fn from(rejection: JsonRejection) -> Self {
        DispatchError::Validation(rejection.body_text())
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> axum::response::Response {
        let message = match &self {
            DispatchError::Storage(e) => {
                tracing::error!(error = %e, "Storage failure");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let body = Json(json!({
            "error": self.kind(),
            "message": message,
        }));
        (self.status_code(), body).into_response()
    }
}
