//! Error handling for the job service.
//!
//! This module provides:
//! - A single error type with machine-readable codes
//! - HTTP status code mapping for API responses
//! - User-friendly messages vs detailed internal messages
//! - Error logging with tracing integration
//! - Metrics integration for error tracking

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

/// A specialized Result type for job service operations.
pub type Result<T> = std::result::Result<T, StevedoreError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by the calling control plane
/// for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Request validation
    ValidationError,
    InvalidCronSpec,

    // Job lifecycle
    JobNotFound,
    ConflictError,
    StatusMismatch,
    UnknownAction,

    // Authentication
    Unauthorized,

    // Backend (Redis)
    BackendError,
    BackendUnreachable,

    // Serialization
    SerializationError,

    // Configuration
    ConfigurationError,

    // Internal
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::ValidationError | Self::InvalidCronSpec => StatusCode::BAD_REQUEST,
            Self::JobNotFound => StatusCode::NOT_FOUND,
            Self::ConflictError | Self::StatusMismatch => StatusCode::CONFLICT,
            Self::UnknownAction => StatusCode::NOT_IMPLEMENTED,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BackendUnreachable => StatusCode::SERVICE_UNAVAILABLE,
            Self::BackendError
            | Self::SerializationError
            | Self::ConfigurationError
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is worth retrying at the caller.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendError | Self::BackendUnreachable)
    }

    /// Get the error category for grouping in metrics.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::ValidationError | Self::InvalidCronSpec => "validation",
            Self::JobNotFound | Self::ConflictError | Self::StatusMismatch | Self::UnknownAction => {
                "job"
            }
            Self::Unauthorized => "authentication",
            Self::BackendError | Self::BackendUnreachable => "backend",
            Self::SerializationError => "serialization",
            Self::ConfigurationError => "configuration",
            Self::InternalError => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the job service.
///
/// Carries a structured error code, a user-facing message safe to return
/// to API clients, and an optional internal message for the logs.
#[derive(Error, Debug)]
pub struct StevedoreError {
    code: ErrorCode,
    user_message: Cow<'static, str>,
    internal_message: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for StevedoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl StevedoreError {
    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let err = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        };
        err.record_metrics();
        err
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut err = Self::new(code, user_message);
        err.internal_message = Some(internal_message.into());
        err
    }

    /// Create a validation error (400).
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a job-not-found error (404).
    pub fn job_not_found(job_id: &str) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("job '{}' not found", job_id))
    }

    /// Create a conflict error for duplicated unique jobs (409).
    pub fn conflict(job_name: &str) -> Self {
        Self::new(
            ErrorCode::ConflictError,
            format!(
                "a live job with name '{}' and the same parameters already exists",
                job_name
            ),
        )
    }

    /// Create a status-mismatch error for control operations (409).
    pub fn status_mismatch(job_id: &str, required: &str) -> Self {
        Self::new(
            ErrorCode::StatusMismatch,
            format!("job '{}' is not in the required '{}' state", job_id, required),
        )
    }

    /// Create an unauthorized error (401).
    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "an internal error occurred", message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "service configuration is invalid",
            message,
        )
    }

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-facing message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message, if any.
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the HTTP status code.
    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// Log this error with severity keyed off the status class.
    pub fn log(&self) {
        let status = self.http_status();
        if status.is_server_error() {
            error!(
                error_code = %self.code,
                category = self.code.category(),
                http_status = status.as_u16(),
                user_message = %self.user_message,
                internal_message = ?self.internal_message,
                "request failed"
            );
        } else {
            warn!(
                error_code = %self.code,
                category = self.code.category(),
                http_status = status.as_u16(),
                user_message = %self.user_message,
                "request rejected"
            );
        }
    }

    fn record_metrics(&self) {
        counter!(
            "stevedore_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string()
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error payload returned to API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&StevedoreError> for ErrorResponse {
    fn from(err: &StevedoreError) -> Self {
        Self {
            code: err.code,
            message: err.user_message.to_string(),
            timestamp: chrono::Utc::now(),
        }
    }
}

impl IntoResponse for StevedoreError {
    fn into_response(self) -> Response {
        self.log();
        let status = self.http_status();
        let body = ErrorResponse::from(&self);
        (status, Json(body)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for StevedoreError {
    fn from(err: redis::RedisError) -> Self {
        let (code, user_msg) = if err.is_connection_refusal() || err.is_connection_dropped() {
            (ErrorCode::BackendUnreachable, "unable to reach the job backend")
        } else if err.is_timeout() {
            (ErrorCode::BackendError, "job backend operation timed out")
        } else {
            (ErrorCode::BackendError, "a job backend error occurred")
        };

        Self::with_internal(code, user_msg, err.to_string()).with_source(err)
    }
}

impl From<serde_json::Error> for StevedoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "failed to process JSON data",
            err.to_string(),
        )
        .with_source(err)
    }
}

impl From<reqwest::Error> for StevedoreError {
    fn from(err: reqwest::Error) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "outbound notification request failed",
            err.to_string(),
        )
        .with_source(err)
    }
}

impl From<std::io::Error> for StevedoreError {
    fn from(err: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::InternalError, "an I/O error occurred", err.to_string())
            .with_source(err)
    }
}

impl From<config::ConfigError> for StevedoreError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

impl From<anyhow::Error> for StevedoreError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<StevedoreError>() {
            Ok(e) => e,
            Err(err) => Self::internal(err.to_string()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(ErrorCode::ValidationError.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::JobNotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::ConflictError.http_status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::UnknownAction.http_status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(ErrorCode::Unauthorized.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ErrorCode::InternalError.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::BackendError.is_retryable());
        assert!(ErrorCode::BackendUnreachable.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
        assert!(!ErrorCode::ConflictError.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = StevedoreError::with_internal(
            ErrorCode::BackendError,
            "a job backend error occurred",
            "connection refused: localhost:6379",
        );

        let display = format!("{}", err);
        assert!(display.contains("BackendError"));
        assert!(display.contains("connection refused"));
    }

    #[test]
    fn test_conflict_constructor() {
        let err = StevedoreError::conflict("demo");
        assert_eq!(err.code(), ErrorCode::ConflictError);
        assert_eq!(err.http_status(), StatusCode::CONFLICT);
        assert!(err.user_message().contains("demo"));
    }

    #[test]
    fn test_error_response_serialization() {
        let err = StevedoreError::validation("name of job must be specified");
        let response = ErrorResponse::from(&err);

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("VALIDATION_ERROR"));
        assert!(json.contains("name of job must be specified"));
    }
}
