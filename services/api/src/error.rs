//! services/api/src/error.rs
//!
//! The service's error type and the mapping from port failures to HTTP
//! statuses used by every handler.

use axum::http::StatusCode;
use tracing::error;
use verse_study_core::ports::PortError;

use crate::config::ConfigError;

/// Errors that can stop the service from starting or serving.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration Error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("WebSocket Error: {0}")]
    Websocket(#[from] axum::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The AI adapters cannot be built without a key.
    #[error("OPENAI_API_KEY is required")]
    MissingApiKey,

    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

/// The HTTP status a port failure should surface as.
pub fn status_for(e: &PortError) -> StatusCode {
    match e {
        PortError::NotFound(_) => StatusCode::NOT_FOUND,
        PortError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        PortError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PortError::Unauthorized => StatusCode::UNAUTHORIZED,
        PortError::Unexpected(_) => StatusCode::BAD_GATEWAY,
    }
}

/// Logs a failed operation and turns it into a handler rejection. Upstream
/// failures are reported generically; input problems are echoed back.
pub fn reject(context: &str, e: PortError) -> (StatusCode, String) {
    let status = status_for(&e);
    error!(error = %e, "{} failed", context);
    let message = match e {
        PortError::InvalidInput(reason) => reason,
        PortError::Unauthorized => "Not signed in".to_string(),
        _ => format!("{} failed. Please try again.", context),
    };
    (status, message)
}
