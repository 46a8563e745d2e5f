use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::cache::FetchError;
use crate::catalog::CatalogError;
use crate::ingest::IngestError;

pub type ApiResult<T> = Result<T, ApiError>;

/// HTTP-facing error: a status code plus the stable kind string clients
/// switch on.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub detail: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    detail: &'a str,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", detail)
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", detail)
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.kind,
            detail: &self.detail,
        });
        (self.status, body).into_response()
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        match &err {
            CatalogError::NotFound { .. } => ApiError::not_found(err.to_string()),
            CatalogError::Integrity { .. } => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTEGRITY_VIOLATION",
                err.to_string(),
            ),
            _ => ApiError::internal(err.to_string()),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        match &err {
            FetchError::Timeout => ApiError::new(
                StatusCode::BAD_GATEWAY,
                "FETCH_TIMEOUT",
                err.to_string(),
            ),
            FetchError::AccountUnavailable(_) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "ACCOUNT_UNAVAILABLE",
                err.to_string(),
            ),
            FetchError::Failed(_) | FetchError::Interrupted => ApiError::new(
                StatusCode::BAD_GATEWAY,
                "FETCH_FAILED",
                err.to_string(),
            ),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match &err {
            IngestError::Conflict(_) => ApiError::conflict(err.to_string()),
            _ => {
                let kind = err.reason_code();
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, kind, err.to_string())
            }
        }
    }
}
