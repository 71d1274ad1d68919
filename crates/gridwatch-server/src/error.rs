use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use gridwatch_store::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid API key")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("Building {0} not found")]
    UnknownBuilding(i64),

    #[error("Too many requests")]
    RateLimited,

    #[error("Storage temporarily unavailable")]
    Unavailable,

    #[error("Internal error")]
    Internal,
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Busy => ApiError::Unavailable,
            other => {
                tracing::error!(error = %other, "store error on request path");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownBuilding(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "status": "error",
            "message": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
