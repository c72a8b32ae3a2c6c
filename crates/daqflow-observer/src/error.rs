//! Failures of the read endpoints.
//!
//! Command endpoints answer with the dispatcher's [`ControlResponse`]
//! directly; only reads that have nothing to return end up here.
//!
//! [`ControlResponse`]: daqflow_types::ControlResponse

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use daqflow_types::ExecutionId;

/// Errors returned by the status API's read endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    /// Neither the live registry nor the finished history knows the id.
    #[error("execution {execution_id} not found")]
    ExecutionNotFound {
        /// The requested execution.
        execution_id: ExecutionId,
    },

    /// The liveness loop has not completed a beat yet.
    #[error("no heartbeat recorded yet")]
    NoHeartbeat,

    /// The dispatcher answered a query with a response of the wrong kind.
    #[error("dispatcher answered with unexpected `{msg_type}`")]
    UnexpectedResponse {
        /// Tag of the response received.
        msg_type: &'static str,
    },
}

impl ObserverError {
    /// HTTP status for this error.
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::ExecutionNotFound { .. } => StatusCode::NOT_FOUND,
            Self::NoHeartbeat => StatusCode::SERVICE_UNAVAILABLE,
            Self::UnexpectedResponse { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ObserverError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });
        (status, axum::Json(body)).into_response()
    }
}
