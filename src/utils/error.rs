//! Error handling module
//!
//! `AppError` is the working error of the relay core. It is rendered as the
//! OpenAI error envelope at the HTTP boundary.

use crate::models::openai::{ErrorWithStatusCode, OpenAIError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// Upstream transport failure (connect, timeout, broken body)
    #[error("Upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Serialization of an outgoing body failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Request validation failed
    #[error("Request validation failed: {0}")]
    Validation(String),

    /// A specific request field is invalid
    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    /// The adaptor does not implement the requested mode
    #[error("Channel '{channel}' does not support mode '{mode}'")]
    UnsupportedMode { channel: String, mode: String },

    /// A field cannot be represented in the provider schema
    #[error("Request conversion failed: {0}")]
    Conversion(String),

    /// Channel key material is malformed or rejected
    #[error("Invalid channel credential: {0}")]
    Credential(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Upstream returned an error
    #[error("Upstream error ({status}): {message}")]
    Upstream {
        status: StatusCode,
        message: String,
        error_type: String,
        code: Option<Value>,
    },

    /// Upstream body could not be decoded
    #[error("Failed to decode upstream response: {0}")]
    Decode(String),

    /// The provider offers no balance API
    #[error("Balance query is not implemented for channel '{0}'")]
    BalanceNotImplemented(String),

    /// The caller went away while the response was being written
    #[error("Client closed the connection")]
    ClientClosed,

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_)
            | AppError::InvalidField { .. }
            | AppError::UnsupportedMode { .. }
            | AppError::Conversion(_) => StatusCode::BAD_REQUEST,
            AppError::Credential(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Upstream { status, .. } => *status,
            AppError::Transport(_) => StatusCode::BAD_GATEWAY,
            AppError::BalanceNotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            AppError::ClientClosed => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            AppError::Config(_)
            | AppError::Serialization(_)
            | AppError::Decode(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get error type string
    pub fn error_type(&self) -> String {
        match self {
            AppError::Validation(_)
            | AppError::InvalidField { .. }
            | AppError::UnsupportedMode { .. }
            | AppError::Conversion(_)
            | AppError::NotFound(_) => "invalid_request_error".to_string(),
            AppError::Credential(_) => "authentication_error".to_string(),
            AppError::Upstream { error_type, .. } if !error_type.is_empty() => error_type.clone(),
            AppError::Upstream { .. } | AppError::Transport(_) | AppError::Decode(_) => {
                "upstream_error".to_string()
            }
            AppError::BalanceNotImplemented(_) => "not_implemented".to_string(),
            AppError::ClientClosed => "client_closed".to_string(),
            AppError::Config(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                "airelay_error".to_string()
            }
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> Option<Value> {
        let code = match self {
            AppError::Validation(_) | AppError::InvalidField { .. } => "invalid_request",
            AppError::UnsupportedMode { .. } => "unsupported_mode",
            AppError::Conversion(_) => "convert_request_failed",
            AppError::Credential(_) => "invalid_key",
            AppError::NotFound(_) => "not_found",
            AppError::Upstream { code, .. } => return code.clone(),
            AppError::Transport(_) => "do_request_failed",
            AppError::Decode(_) => "unmarshal_response_body_failed",
            AppError::BalanceNotImplemented(_) => "balance_not_implemented",
            AppError::ClientClosed => "client_closed",
            AppError::Serialization(_) => "marshal_request_body_failed",
            AppError::Config(_) | AppError::Internal(_) => "internal_error",
        };
        Some(Value::String(code.to_string()))
    }

    /// Whether detailed error information should be logged
    pub fn should_log_details(&self) -> bool {
        !matches!(
            self,
            AppError::Validation(_)
                | AppError::InvalidField { .. }
                | AppError::NotFound(_)
                | AppError::Credential(_)
                | AppError::ClientClosed
        )
    }

    /// Log at error level for server-side failures, warn for client errors
    pub fn log(&self) {
        let status = self.status_code();
        if self.should_log_details() {
            tracing::error!("Application error: {} - Status code: {}", self, status);
        } else {
            tracing::warn!("Client error: {} - Status code: {}", self.error_type(), status);
        }
    }

    /// Convert to the canonical error crossing the relay boundary
    pub fn to_error_with_status(&self) -> ErrorWithStatusCode {
        let message = match self {
            AppError::Upstream { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let param = match self {
            AppError::InvalidField { field, .. } => Some(field.clone()),
            _ => None,
        };

        ErrorWithStatusCode {
            error: OpenAIError {
                message,
                error_type: self.error_type(),
                param,
                code: self.code(),
            },
            status_code: self.status_code(),
        }
    }
}

impl IntoResponse for ErrorWithStatusCode {
    fn into_response(self) -> Response {
        let status = self.status_code;
        (status, Json(self)).into_response()
    }
}

/// Implement IntoResponse trait to allow errors to be returned directly as HTTP responses
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.log();
        self.to_error_with_status().into_response()
    }
}

/// Result type alias
pub type AppResult<T> = Result<T, AppError>;

/// Error handling helper functions
pub mod helpers {
    use super::*;

    /// Create validation error
    pub fn validation_error(message: impl Into<String>) -> AppError {
        AppError::Validation(message.into())
    }

    /// Create invalid field error
    pub fn field_error(field: impl Into<String>, message: impl Into<String>) -> AppError {
        AppError::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create conversion error
    pub fn conversion_error(message: impl Into<String>) -> AppError {
        AppError::Conversion(message.into())
    }

    /// Create credential error
    pub fn credential_error(message: impl Into<String>) -> AppError {
        AppError::Credential(message.into())
    }

    /// Create decode error
    pub fn decode_error(message: impl Into<String>) -> AppError {
        AppError::Decode(message.into())
    }

    /// Create upstream error with the status the provider answered
    pub fn upstream_error(status: StatusCode, message: impl Into<String>) -> AppError {
        AppError::Upstream {
            status,
            message: message.into(),
            error_type: "upstream_error".to_string(),
            code: None,
        }
    }

    /// Create internal error
    pub fn internal_error(message: impl Into<String>) -> AppError {
        AppError::Internal(message.into())
    }
}

/// Error context extension trait
pub trait ErrorContext<T> {
    /// Add validation error context
    fn validation_context(self, message: &str) -> AppResult<T>;

    /// Add conversion error context
    fn conversion_context(self, message: &str) -> AppResult<T>;

    /// Add decode error context
    fn decode_context(self, message: &str) -> AppResult<T>;

    /// Add credential error context
    fn credential_context(self, message: &str) -> AppResult<T>;

    /// Add internal error context
    fn internal_context(self, message: &str) -> AppResult<T>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn validation_context(self, message: &str) -> AppResult<T> {
        self.map_err(|e| AppError::Validation(format!("{}: {}", message, e)))
    }

    fn conversion_context(self, message: &str) -> AppResult<T> {
        self.map_err(|e| AppError::Conversion(format!("{}: {}", message, e)))
    }

    fn decode_context(self, message: &str) -> AppResult<T> {
        self.map_err(|e| AppError::Decode(format!("{}: {}", message, e)))
    }

    fn credential_context(self, message: &str) -> AppResult<T> {
        self.map_err(|e| AppError::Credential(format!("{}: {}", message, e)))
    }

    fn internal_context(self, message: &str) -> AppResult<T> {
        self.map_err(|e| AppError::Internal(format!("{}: {}", message, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(AppError::Validation("test".to_string()).status_code(), StatusCode::BAD_REQUEST);
        let unsupported = AppError::UnsupportedMode {
            channel: "moonshot".into(),
            mode: "images_generations".into(),
        };
        assert_eq!(unsupported.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::Credential("bad".to_string()).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::NotFound("test".to_string()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::Decode("x".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::BalanceNotImplemented("anthropic".into()).status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(AppError::ClientClosed.status_code().as_u16(), 499);
    }

    #[test]
    fn test_upstream_status_is_echoed() {
        let err = helpers::upstream_error(StatusCode::TOO_MANY_REQUESTS, "slow down");
        let canonical = err.to_error_with_status();
        assert_eq!(canonical.status_code, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(canonical.error.message, "slow down");
        assert_eq!(canonical.error.error_type, "upstream_error");
    }

    #[test]
    fn test_invalid_field_param() {
        let canonical =
            helpers::field_error("n", "must be between 1 and 10").to_error_with_status();
        assert_eq!(canonical.error.param.as_deref(), Some("n"));
        assert_eq!(canonical.error.code, Some(Value::String("invalid_request".into())));
    }

    #[test]
    fn test_error_context() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));

        match result.decode_context("Failed to read body") {
            Err(AppError::Decode(msg)) => {
                assert!(msg.contains("Failed to read body"));
                assert!(msg.contains("file not found"));
            }
            other => panic!("Expected decode error, got {:?}", other),
        }
    }
}
