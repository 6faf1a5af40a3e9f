use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Sync already in progress for connection {0}")]
    SyncInProgress(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Calendar sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Errors raised by the synchronization engine (cipher, CalDAV client, translator).
///
/// The variants map onto how a sync run reacts:
/// - `Authentication`: credentials rejected, the connection moves to `ERROR`.
/// - `Protocol`: malformed remote payload, skipped per object.
/// - `Transient`: timeouts and connectivity, the run aborts but the connection stays `ACTIVE`.
/// - `Encryption`: cipher failure, fatal for the run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Remote calendar rejected the credentials: {0}")]
    Authentication(String),

    #[error("Remote resource not found: {0}")]
    NotFound(String),

    #[error("Transient remote calendar failure: {0}")]
    Transient(String),

    #[error("Remote calendar protocol error: {0}")]
    Protocol(String),

    #[error("Encryption error: {0}")]
    Encryption(String),
}

impl SyncError {
    /// Whether the connection must stop auto-scheduling until the user acts.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            SyncError::Authentication(_) | SyncError::Encryption(_) | SyncError::NotFound(_)
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::SyncInProgress(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                "SYNC_IN_PROGRESS",
                self.to_string(),
            ),
            AppError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                msg.clone(),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::Jwt(e) => {
                tracing::warn!("JWT error: {:?}", e);
                (
                    StatusCode::UNAUTHORIZED,
                    "INVALID_TOKEN",
                    "Invalid or expired token".to_string(),
                )
            }
            AppError::Sync(e) => {
                tracing::warn!("Calendar sync error: {}", e);
                match e {
                    SyncError::Authentication(_) => (
                        StatusCode::UNAUTHORIZED,
                        "CALENDAR_AUTH_FAILED",
                        "The remote calendar rejected the credentials".to_string(),
                    ),
                    SyncError::NotFound(_) => (
                        StatusCode::NOT_FOUND,
                        "CALENDAR_NOT_FOUND",
                        "The remote calendar resource was not found".to_string(),
                    ),
                    SyncError::Transient(_) => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "CALENDAR_UNAVAILABLE",
                        "The remote calendar is temporarily unavailable".to_string(),
                    ),
                    SyncError::Protocol(_) => (
                        StatusCode::BAD_GATEWAY,
                        "CALENDAR_PROTOCOL_ERROR",
                        "The remote calendar returned an unexpected response".to_string(),
                    ),
                    SyncError::Encryption(_) => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "ENCRYPTION_ERROR",
                        "Stored credentials could not be read".to_string(),
                    ),
                }
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
