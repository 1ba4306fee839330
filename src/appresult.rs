use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;

use crate::error::ChatError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<ChatError>() {
            Some(ChatError::InvalidRoom { .. })
            | Some(ChatError::EmptyMessage)
            | Some(ChatError::RoomMismatch { .. }) => StatusCode::BAD_REQUEST,
            Some(ChatError::RoomNotFound(_)) => StatusCode::NOT_FOUND,
            Some(ChatError::RoomExists(_)) => StatusCode::CONFLICT,
            Some(ChatError::Unauthorized) => StatusCode::UNAUTHORIZED,
            Some(ChatError::StorageUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = ?self.0, "request failed");
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
