//! API error handling
//!
//! Maps the error kinds of the core subsystems onto HTTP statuses:
//! Validation 400, AuthFailure 403, NotFound 404, upstream transients 502,
//! ShuttingDown 503, everything else 500.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::pool::PoolError;
use crate::qbit::QbitError;
use crate::stream::StreamError;
use crate::sync::SyncError;

/// Application error type
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", err);
        Self::internal(err.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        Self::internal(format!("Database error: {}", err))
    }
}

impl From<QbitError> for AppError {
    fn from(err: QbitError) -> Self {
        let status = match &err {
            // 403 over 401: proxies in front of us tend to strip Basic
            // auth headers, which turns 401 into a login loop.
            QbitError::AuthenticationFailed => StatusCode::FORBIDDEN,
            QbitError::TorrentNotFound(_) => StatusCode::NOT_FOUND,
            QbitError::Status(code) if code.as_u16() == 404 => StatusCode::NOT_FOUND,
            e if e.is_transient() => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<PoolError> for AppError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NotFound(_) | PoolError::Disabled(_) => Self::not_found(err.to_string()),
            PoolError::AuthFailure(_) => Self::new(StatusCode::FORBIDDEN, err.to_string()),
            PoolError::Unavailable(_) => Self::new(StatusCode::BAD_GATEWAY, err.to_string()),
        }
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Pool(e) => e.into(),
            SyncError::Upstream(e) => e.into(),
            SyncError::InvalidFilter(_) => Self::bad_request(err.to_string()),
        }
    }
}

impl From<StreamError> for AppError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Validation(_) => Self::bad_request(err.to_string()),
            StreamError::ShuttingDown => Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let e: AppError = QbitError::AuthenticationFailed.into();
        assert_eq!(e.status, StatusCode::FORBIDDEN);

        let e: AppError = QbitError::ConnectionFailed("refused".into()).into();
        assert_eq!(e.status, StatusCode::BAD_GATEWAY);

        let e: AppError = QbitError::TorrentNotFound("ABC".into()).into();
        assert_eq!(e.status, StatusCode::NOT_FOUND);

        let e: AppError = SyncError::InvalidFilter("bogus".into()).into();
        assert_eq!(e.status, StatusCode::BAD_REQUEST);

        let e: AppError = StreamError::ShuttingDown.into();
        assert_eq!(e.status, StatusCode::SERVICE_UNAVAILABLE);

        let e: AppError = PoolError::NotFound(7).into();
        assert_eq!(e.status, StatusCode::NOT_FOUND);
    }
}
