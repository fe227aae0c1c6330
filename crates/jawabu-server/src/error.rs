use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jawabu_core::CoreError;

/// HTTP-facing error with a stable JSON body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match &err {
            CoreError::BadRequest(_) => Self::bad_request(err.to_string()),
            CoreError::UpstreamUnavailable(_) => Self {
                status: StatusCode::BAD_GATEWAY,
                message: err.to_string(),
            },
            _ => Self::internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": { "message": self.message }
        }));
        (self.status, body).into_response()
    }
}
