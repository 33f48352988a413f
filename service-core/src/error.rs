use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Seconds a client should wait before retrying a connectivity failure.
const RETRY_AFTER_SECS: u64 = 2;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    /// Pool unavailable, acquire timeout or statement timeout. Retryable.
    #[error("Connectivity error: {0}")]
    Connectivity(anyhow::Error),

    /// Stored ledger state contradicts itself (e.g. negative demand).
    #[error("Integrity error: {0}")]
    Integrity(anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Connectivity(_))
    }

    /// Short, low-cardinality label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "validation_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Connectivity(_) => "connectivity_error",
            AppError::Integrity(_) => "integrity_error",
            AppError::InternalError(_) => "internal_error",
            AppError::DatabaseError(_) => "db_error",
            AppError::ConfigError(_) => "config_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Connectivity(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Integrity(_)
            | AppError::InternalError(_)
            | AppError::DatabaseError(_)
            | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
        }

        let status = self.status_code();
        let retryable = self.is_retryable();

        let (error_message, details) = match self {
            AppError::ValidationError(err) => {
                ("Validation error".to_string(), Some(err.to_string()))
            }
            AppError::BadRequest(err) | AppError::NotFound(err) | AppError::Conflict(err) => {
                (err.to_string(), None)
            }
            // Never leak connection strings or pool internals to callers.
            AppError::Connectivity(_) => ("Service temporarily unavailable".to_string(), None),
            AppError::Integrity(err) => (
                "Ledger integrity error".to_string(),
                Some(err.to_string()),
            ),
            AppError::InternalError(err) => (
                "Internal server error".to_string(),
                Some(format!("{:#?}", err)),
            ),
            AppError::DatabaseError(err) => ("Database error".to_string(), Some(err.to_string())),
            AppError::ConfigError(err) => {
                ("Configuration error".to_string(), Some(err.to_string()))
            }
        };

        let mut res = (
            status,
            Json(ErrorResponse {
                error: error_message,
                details,
            }),
        )
            .into_response();

        if retryable {
            res.headers_mut()
                .insert(axum::http::header::RETRY_AFTER, RETRY_AFTER_SECS.into());
        }

        res
    }
}
