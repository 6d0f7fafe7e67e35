//! Unified API error handling with structured responses.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::agent::McpConfigError;
use crate::narration::NarrationError;
use crate::session::RegistryError;

/// API error type with structured responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    /// `details` is only shown to clients in development.
    #[error("{message}")]
    Internal {
        message: String,
        details: Option<String>,
    },

    /// The narration service refused a request; its status and body are relayed.
    #[error("{message}")]
    Upstream {
        status: u16,
        message: String,
        details: String,
    },
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            details: None,
        }
    }

    /// Map a narration failure, using `context` as the client-facing message.
    pub fn narration(context: &str, err: NarrationError) -> Self {
        match err {
            NarrationError::Upstream { status, body, .. } => Self::Upstream {
                status,
                message: context.to_string(),
                details: body,
            },
            other => Self::Internal {
                message: context.to_string(),
                details: Some(error_chain(&other)),
            },
        }
    }

    pub(crate) fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }

    pub(crate) fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Conflict(_) => "CONFLICT",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Internal { .. } => "INTERNAL_ERROR",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Attached to error responses for the diagnostics middleware.
#[derive(Debug, Clone)]
pub struct ErrorDetails {
    pub message: String,
    pub code: &'static str,
    /// Diagnostic detail withheld from the body outside development.
    pub hidden: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal { details, .. } => {
                error!(error_code = code, message = %message, details = ?details, "API error");
            }
            ApiError::Upstream { status, .. } => {
                warn!(error_code = code, upstream_status = status, message = %message, "Upstream error");
            }
            ApiError::ServiceUnavailable(msg) => {
                warn!(error_code = code, message = %msg, "Service unavailable");
            }
            _ => {
                tracing::debug!(error_code = code, message = %message, "Client error");
            }
        }

        let (details, hidden) = match self {
            ApiError::Upstream { details, .. } => (Some(details), None),
            ApiError::Internal { details, .. } => (None, details),
            _ => (None, None),
        };

        let body = ErrorResponse {
            error: message.clone(),
            code,
            details,
        };

        let mut response = (status, Json(body)).into_response();
        response.extensions_mut().insert(ErrorDetails {
            message,
            code,
            hidden,
        });
        response
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidInput(msg) => ApiError::BadRequest(msg),
            RegistryError::NotFound(_) => ApiError::NotFound(err.to_string()),
            RegistryError::StreamInProgress(_) => ApiError::Conflict(err.to_string()),
            RegistryError::McpConfig(
                e @ (McpConfigError::InvalidJson(_) | McpConfigError::NotAnObject),
            ) => ApiError::BadRequest(format!("Invalid mcpConfig: {}", e)),
            other => ApiError::Internal {
                message: "Failed to start agent query".to_string(),
                details: Some(error_chain(&other)),
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// `err` followed by each of its sources, colon separated.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !chain.ends_with(&text) {
            chain.push_str(": ");
            chain.push_str(&text);
        }
        source = cause.source();
    }
    chain
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
