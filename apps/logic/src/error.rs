use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::conn::LogicError;

/// Error body returned on the producer HTTP surface.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub code: i32,
    pub message: String,
}

/// Application-level error that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
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

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            code: self.status.as_u16() as i32,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<LogicError> for ApiError {
    fn from(err: LogicError) -> Self {
        match err {
            LogicError::Token(_) => Self::bad_request(err.to_string()),
            _ => {
                tracing::error!(error = %err, "logic operation failed");
                Self::internal("An internal error occurred")
            }
        }
    }
}
