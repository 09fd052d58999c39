use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use pollcast_core::error::CoreError;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("Poll not found or closed")]
    PollUnavailable,
    #[error("Invalid option")]
    InvalidOption,
    #[error("Too many requests")]
    RateLimited { retry_after_seconds: u64 },
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Machine-readable error code string.
    fn error_code(&self) -> &'static str {
        match self {
            ApiError::NotFound => "NOT_FOUND",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::PollUnavailable => "POLL_UNAVAILABLE",
            ApiError::InvalidOption => "INVALID_OPTION",
            ApiError::RateLimited { .. } => "RATE_LIMITED",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) | ApiError::PollUnavailable | ApiError::InvalidOption => {
                StatusCode::BAD_REQUEST
            }
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        if let ApiError::RateLimited {
            retry_after_seconds,
        } = self
        {
            let body = json!({
                "code": code,
                "error": "Too many requests",
                "retryAfter": retry_after_seconds,
            });
            let mut response = (status, Json(body)).into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_seconds));
            return response;
        }

        let message = match &self {
            ApiError::Internal(err) => {
                tracing::error!("API internal error: {err:#}");
                "internal server error".to_string()
            }
            ApiError::ServiceUnavailable(reason) => {
                tracing::warn!("API transient failure: {reason}");
                "service temporarily unavailable".to_string()
            }
            ApiError::BadRequest(msg) => msg.clone(),
            other => other.to_string(),
        };

        let body = json!({
            "code": code,
            "message": message,
            "error": message,
            "details": Value::Null,
        });

        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::NotFound => ApiError::NotFound,
            CoreError::NotFoundOrClosed => ApiError::PollUnavailable,
            CoreError::InvalidOption => ApiError::InvalidOption,
            CoreError::Forbidden | CoreError::InvalidToken => ApiError::Forbidden,
            CoreError::RateLimited {
                retry_after_seconds,
            } => ApiError::RateLimited {
                retry_after_seconds,
            },
            CoreError::BadRequest(msg) | CoreError::MalformedMessage(msg) => {
                ApiError::BadRequest(msg)
            }
            CoreError::Database(err) => ApiError::ServiceUnavailable(format!("database: {err}")),
            CoreError::Bus(err) => ApiError::ServiceUnavailable(format!("bus: {err}")),
            CoreError::Internal(msg) => ApiError::Internal(anyhow::anyhow!(msg)),
        }
    }
}
