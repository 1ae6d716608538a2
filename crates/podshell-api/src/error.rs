//! Error types for the HTTP surface
//!
//! Errors raised before the websocket upgrade are answered with a
//! Kubernetes-style `Status` body, the shape kubectl and dashboards expect.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use podshell_exec::EligibilityError;

/// Result type for server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for server operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid request parameters
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Exec session error
    #[error(transparent)]
    Exec(#[from] podshell_exec::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            Error::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            Error::Exec(podshell_exec::Error::Eligibility(e)) => match e {
                EligibilityError::NotFound { .. } | EligibilityError::ContainerNotFound { .. } => {
                    (StatusCode::NOT_FOUND, "NotFound")
                }
                EligibilityError::Terminated { .. } => (StatusCode::CONFLICT, "Conflict"),
                EligibilityError::InitContainerTarget { .. } => {
                    (StatusCode::BAD_REQUEST, "BadRequest")
                }
            },
            Error::Exec(podshell_exec::Error::Kube { .. }) => {
                (StatusCode::BAD_GATEWAY, "ServiceUnavailable")
            }
            Error::Exec(podshell_exec::Error::Transport { .. }) => {
                (StatusCode::BAD_GATEWAY, "ServiceUnavailable")
            }
            Error::Exec(_) | Error::Config(_) | Error::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError")
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, reason) = self.status();

        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": self.to_string(),
            "reason": reason,
            "code": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}
