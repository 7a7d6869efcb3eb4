use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Failure reported by a [`TextGenerator`](crate::engine::TextGenerator).
///
/// The `Display` text is what callers see, either as the `error` field of a
/// 500 body or inside an in-stream error frame.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("{0}")]
    Session(String),
    #[error("{0}")]
    Engine(String),
    #[error("{0}")]
    Io(String),
}

impl From<std::io::Error> for GenerationError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Errors surfaced by the HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Messages array is required")]
    MissingMessages,
    #[error("{0}")]
    BadRequest(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingMessages | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Rejected request");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
