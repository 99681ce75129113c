use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::messages::anthropic;

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Gateway errors with appropriate HTTP status codes.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed inbound request, rejected before contacting the backend.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The requested public model is not configured.
    #[error("Model '{0}' not found")]
    ModelNotFound(String),

    /// The client did not present the configured API key.
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// The backend credential could not be obtained.
    #[error("Backend credential unavailable: {0}")]
    Auth(#[from] AuthError),

    /// The backend kept failing with 5xx or timeouts until the retry schedule was exhausted.
    #[error("Backend unavailable after {attempts} attempts: {message}")]
    Backend { attempts: usize, message: String },

    /// The backend rejected the request with a non-retryable status.
    #[error("Backend API error ({status}): {message}")]
    BackendRejected { status: u16, message: String },

    /// The backend byte stream was corrupt or violated the event schema.
    #[error("Backend stream error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The backend reported an exception inside the event stream.
    #[error("Backend exception ({kind}): {message}")]
    UpstreamException { kind: String, message: String },

    /// Internal server error.
    /// If Some(message), it can be shown to the client.
    #[error("Internal server error")]
    Internal(Option<String>),
}

impl GatewayError {
    /// Get the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Auth(error) => match error {
                AuthError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
                AuthError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::UNAUTHORIZED,
            },
            Self::Backend { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::BackendRejected { status, .. } => match *status {
                400 => StatusCode::BAD_REQUEST,
                401 => StatusCode::UNAUTHORIZED,
                403 => StatusCode::FORBIDDEN,
                404 => StatusCode::NOT_FOUND,
                429 => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::Protocol(_) | Self::UpstreamException { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type string for the response.
    pub fn error_type(&self) -> &str {
        match self {
            Self::Validation(_) => "invalid_request_error",
            Self::ModelNotFound(_) => "not_found_error",
            Self::Unauthorized(_) => "authentication_error",
            Self::Auth(AuthError::Transient(_)) => "api_error",
            Self::Auth(AuthError::Store(_)) => "internal_error",
            Self::Auth(_) => "authentication_error",
            Self::BackendRejected { status: 400, .. } => "invalid_request_error",
            Self::BackendRejected { status: 429, .. } => "rate_limit_error",
            Self::Backend { .. } | Self::BackendRejected { .. } | Self::Protocol(_) | Self::UpstreamException { .. } => {
                "api_error"
            }
            Self::Internal(_) => "internal_error",
        }
    }

    /// Message that is safe to expose to API consumers.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(Some(message)) => message.clone(),
            Self::Internal(None) => "Internal server error".to_string(),
            Self::Auth(AuthError::Store(_)) => "Backend credential store is unavailable".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Failures of the binary event stream. Fatal for the stream they occur in.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("crc mismatch ({0})")]
    CrcMismatch(&'static str),

    #[error("invalid frame length: total {total}, headers {headers}")]
    InvalidLength { total: u32, headers: u32 },

    #[error("frame of {0} bytes exceeds the 16 MiB limit")]
    FrameTooLarge(u32),

    #[error("truncated frame")]
    TruncatedFrame,

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("malformed {event} payload: {reason}")]
    MalformedPayload { event: String, reason: String },

    #[error("tool use event for unknown id '{0}'")]
    UnknownToolUse(String),

    /// The connection broke while the response body was streaming.
    #[error("response body interrupted: {0}")]
    Interrupted(String),
}

/// Failures obtaining a valid backend credential.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// The identity provider refused the refresh token.
    #[error("refresh token rejected: {0}")]
    Rejected(String),

    #[error("client registration expired at {0}, log in again with kiro-cli")]
    RegistrationExpired(jiff::Timestamp),

    #[error("no credential found: {0}")]
    Missing(String),

    #[error("credential store error: {0}")]
    Store(String),

    /// Network failure or 5xx from the identity provider.
    #[error("identity provider unreachable: {0}")]
    Transient(String),
}

impl AuthError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Error response format compatible with OpenAI API.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    message: String,
    r#type: String,
    code: u16,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error_response = ErrorResponse {
            error: ErrorDetails {
                message: self.client_message(),
                r#type: self.error_type().to_string(),
                code: status.as_u16(),
            },
        };

        (status, Json(error_response)).into_response()
    }
}

pub struct AnthropicErrorResponse {
    status: StatusCode,
    body: anthropic::ErrorResponse,
}

impl From<GatewayError> for AnthropicErrorResponse {
    fn from(error: GatewayError) -> Self {
        let status = error.status_code();
        let body = anthropic::ErrorResponse::from(error);

        Self { status, body }
    }
}

impl IntoResponse for AnthropicErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub type AnthropicResult<T> = std::result::Result<T, AnthropicErrorResponse>;
