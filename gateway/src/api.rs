use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use skyqueue_core::TurnError;
use thiserror::Error;
use tracing::error;

// Input: what the caller posts to /prompt
#[derive(Debug, Deserialize)]
pub struct PromptRequest {
    #[serde(rename = "Prompt")]
    pub prompt: String,
}

// Output on failure: {"error": "..."} with a status per failure kind
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("missing or invalid function key")]
    Unauthorized,

    #[error(transparent)]
    Turn(#[from] TurnError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Turn(TurnError::SessionCreation(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Turn(TurnError::RunTransport(_)) => StatusCode::BAD_GATEWAY,
            Self::Turn(TurnError::NoAssistantResponse { .. }) => StatusCode::BAD_GATEWAY,
            Self::Turn(TurnError::DeadlineExceeded { .. }) => StatusCode::GATEWAY_TIMEOUT,
            Self::Turn(TurnError::Cancelled { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(%status, error = %self, "prompt request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
