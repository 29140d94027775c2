/// Unified error types for the dual-panel bot
use crate::panel::Panel;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the bot
#[derive(Error, Debug)]
pub enum BotError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration errors (startup only)
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors on caller-supplied input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Account absent on every panel, or unknown locally
    #[error("Not found: {0}")]
    NotFound(String),

    /// A panel could not be reached after retries
    #[error("Panel {panel} unavailable: {reason}")]
    PanelUnavailable { panel: Panel, reason: String },

    /// Some targeted panels failed while others succeeded
    #[error("Operation failed on panel(s): {}", failed.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(", "))]
    PartialFailure { failed: Vec<Panel> },

    /// Malformed identity mapping resource
    #[error("Identity map error: {0}")]
    IdentityMap(String),

    /// Notification sink failures
    #[error("Notification error: {0}")]
    Notification(String),

    /// Admin API authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Admin API error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for BotError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            BotError::Authentication(_) => (
                StatusCode::UNAUTHORIZED,
                "AuthenticationRequired",
                self.to_string(),
            ),
            BotError::Validation(_) => (StatusCode::BAD_REQUEST, "InvalidRequest", self.to_string()),
            BotError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound", self.to_string()),
            BotError::PanelUnavailable { .. } | BotError::PartialFailure { .. } => {
                (StatusCode::BAD_GATEWAY, "PanelFailure", self.to_string())
            }
            BotError::IdentityMap(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "IdentityMapInvalid",
                self.to_string(),
            ),
            BotError::Database(_)
            | BotError::Migration(_)
            | BotError::Internal(_)
            | BotError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                "Internal server error".to_string(), // Don't leak details
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                self.to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_code.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for bot operations
pub type BotResult<T> = Result<T, BotError>;
