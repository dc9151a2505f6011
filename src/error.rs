//! # Error Handling
//!
//! Error types shared by the session engine, the transport and the monitor endpoint.
//!
//! ## Error Categories:
//! - **AtCapacity**: non-blocking admission requested while the pool is full
//! - **StreamEstablishment**: the transport could not open a bidirectional stream
//! - **Transport**: either direction of an open stream failed mid-flight
//! - **Cancelled**: a pool-wide or per-session cancellation was observed
//! - **MalformedMessage**: an inbound frame could not be decoded (non-fatal)
//! - **Audio / ConfigError / Io / Internal**: everything around the engine
//!
//! Per-session failures never travel further than the session's own terminal status.
//! Only pool-level failures (no worker runtime, bad configuration) reach `main`.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **AppResult<T>**: shorthand for `Result<T, AppError>`, returned by every fallible
//!   engine operation
//! - **? operator**: returns the error early, converting it with `From` on the way
//!
//! ### Errors as Values Across Tasks
//! - **Clone**: the runner keeps the first failure of either side while the other side's
//!   error is still being inspected, so errors are cloned instead of moved
//! - **PartialEq**: tests compare errors directly
//!
//! ### Traits for Error Conversion
//! - **From trait**: `serde_json`, `config`, `std::io` and `anyhow` errors become `AppError`
//! - **ResponseError trait**: turns an error into a JSON HTTP response for the monitor
//! - **Display trait**: the text that ends up in logs and in a session's final status

use actix_web::{HttpResponse, ResponseError};  // Monitor endpoint error responses
use serde_json::json;                          // JSON error bodies
use std::fmt;                                  // Display implementation

/// Custom error types for the application.
///
/// ## Rust Concepts:
/// - **enum**: one variant per failure category
/// - **String payload**: a human-readable detail, kept in the session's final status
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::Transport("connection reset".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Pool at capacity and the caller asked not to wait
    AtCapacity(String),

    /// The bidirectional stream could not be opened
    StreamEstablishment(String),

    /// Send or receive failed on an open stream
    Transport(String),

    /// Cancellation was observed before the stream completed
    Cancelled(String),

    /// Inbound message could not be decoded
    MalformedMessage(String),

    /// Audio file or PCM input problems
    Audio(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// Local file system failures
    Io(String),

    /// Anything else (task panics, missing runtime)
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::AtCapacity(msg) => write!(f, "Pool at capacity: {}", msg),
            AppError::StreamEstablishment(msg) => write!(f, "Stream establishment failed: {}", msg),
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::Cancelled(msg) => write!(f, "Cancelled: {}", msg),
            AppError::MalformedMessage(msg) => write!(f, "Malformed message: {}", msg),
            AppError::Audio(msg) => write!(f, "Audio error: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Io(msg) => write!(f, "I/O error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Whether this error is the result of a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled(_))
    }
}

/// Converts errors into JSON responses for the monitor endpoint.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "at_capacity",
///     "message": "8 sessions running",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::AtCapacity(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "at_capacity",
                msg.clone(),
            ),
            AppError::StreamEstablishment(msg) | AppError::Transport(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "transport_error",
                msg.clone(),
            ),
            AppError::Cancelled(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "cancelled",
                msg.clone(),
            ),
            AppError::MalformedMessage(msg) | AppError::Audio(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::Io(msg) | AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON failures on the wire are malformed messages, not transport failures.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::MalformedMessage(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
