// Error handling module
// Defines the gateway error taxonomy and HTTP/SSE response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Classification of an authentication failure against an upstream
/// refresh endpoint. Drives token status transitions and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// Refresh token rejected as expired (401 with a recognized body)
    Expired,
    /// Credential rejected for any other non-transient reason
    Invalid,
    /// Network failure or upstream 5xx; the credential may still be good
    Transient,
}

impl AuthErrorKind {
    /// Whether the owning token row should be flipped to `invalid`
    pub fn is_fatal(&self) -> bool {
        matches!(self, AuthErrorKind::Expired | AuthErrorKind::Invalid)
    }
}

/// API errors that can occur during request processing
#[derive(Error, Debug)]
pub enum ApiError {
    /// Missing or invalid client API key
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Upstream credential refresh failed
    #[error("Upstream auth failed ({kind:?}): {message}")]
    UpstreamAuth {
        kind: AuthErrorKind,
        status: Option<u16>,
        message: String,
    },

    /// No active credential could be allocated for the user
    #[error("No credential available: {0}")]
    NoCredentialAvailable(String),

    /// Error from an upstream API
    #[error("Upstream error: {status} - {message}")]
    UpstreamError { status: u16, message: String },

    /// Upstream produced no bytes within the first-token deadline
    #[error("First token timeout after {0}s")]
    FirstTokenTimeout(u64),

    /// Too many consecutive inter-frame read timeouts
    #[error("Stream read timeout: {0}")]
    StreamReadTimeout(String),

    /// Request validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Row exists but belongs to a different user
    #[error("Not found or not owned by caller")]
    OwnershipError,

    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::AuthError(msg) => {
                (StatusCode::UNAUTHORIZED, "authentication_error", msg.clone())
            }
            ApiError::UpstreamAuth { message, .. } => (
                StatusCode::BAD_GATEWAY,
                "api_error",
                format!("Upstream authentication failed: {}", message),
            ),
            ApiError::NoCredentialAvailable(msg) => {
                (StatusCode::FORBIDDEN, "permission_error", msg.clone())
            }
            ApiError::UpstreamError { status, message } => {
                let code =
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (code, "api_error", message.clone())
            }
            ApiError::FirstTokenTimeout(_) | ApiError::StreamReadTimeout(_) => {
                (StatusCode::BAD_GATEWAY, "api_error", self.to_string())
            }
            ApiError::ValidationError(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_request_error",
                msg.clone(),
            ),
            ApiError::OwnershipError => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                "Resource not found".to_string(),
            ),
            ApiError::ConfigError(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "api_error", msg.clone())
            }
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "api_error",
                    "Internal server error".to_string(),
                )
            }
        }
    }

    /// Serialize as an Anthropic SSE error event followed by message_stop.
    ///
    /// Errors that surface after streaming has begun cannot change the HTTP
    /// status, so they travel on the event stream instead.
    pub fn to_sse_events(&self) -> String {
        let (_, error_type, message) = self.parts();
        let payload = json!({
            "type": "error",
            "error": { "type": error_type, "message": message }
        });
        format!(
            "event: error\ndata: {}\n\nevent: message_stop\ndata: {}\n\n",
            payload,
            json!({"type": "message_stop"})
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = self.parts();

        let body = Json(json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
