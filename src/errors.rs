use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::config::ErrorMessage;
use crate::lock::LockTimeout;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("idempotency key header missing")]
    HeaderMissing(ErrorMessage),

    #[error("idempotency key reused with a different payload")]
    Reuse(ErrorMessage),

    #[error("a request with this idempotency key is still outstanding")]
    Retried(ErrorMessage),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("failed to read request body: {0}")]
    BodyUnreadable(axum::Error),

    #[error("lock error: {0}")]
    LockTimeout(#[from] LockTimeout),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, title, msg) = match &self {
            AppError::HeaderMissing(m) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "idempotency_key_missing",
                Some(m.title.clone()),
                m.detail.clone(),
            ),
            AppError::Reuse(m) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_request_error",
                "idempotency_key_reused",
                Some(m.title.clone()),
                m.detail.clone(),
            ),
            AppError::Retried(m) => (
                StatusCode::CONFLICT,
                "conflict_error",
                "idempotency_request_outstanding",
                Some(m.title.clone()),
                m.detail.clone(),
            ),
            AppError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "invalid_request_error",
                "payload_too_large",
                None,
                "request body exceeds size limit".to_string(),
            ),
            AppError::BodyUnreadable(e) => {
                tracing::warn!("request body could not be read: {}", e);
                (
                    StatusCode::BAD_REQUEST,
                    "invalid_request_error",
                    "request_body_unreadable",
                    None,
                    "request body could not be read".to_string(),
                )
            }
            AppError::LockTimeout(e) => {
                tracing::error!("Idempotency lock error: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "internal_error",
                    "idempotency_unavailable",
                    None,
                    "idempotency check temporarily unavailable".to_string(),
                )
            }
            AppError::Store(e) => {
                tracing::error!("Idempotency store error: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "internal_error",
                    "idempotency_unavailable",
                    None,
                    "idempotency check temporarily unavailable".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    None,
                    "internal server error".to_string(),
                )
            }
        };

        let mut error = json!({
            "message": msg,
            "type": error_type,
            "code": code,
        });
        if let Some(title) = title {
            error["title"] = json!(title);
        }

        let mut response = (status, Json(json!({ "error": error }))).into_response();

        // Clients should back off before retrying an outstanding or unavailable key
        if matches!(self, AppError::Retried(_) | AppError::LockTimeout(_) | AppError::Store(_)) {
            response
                .headers_mut()
                .insert("retry-after", axum::http::HeaderValue::from_static("1"));
        }

        response
    }
}
