//! API error handling module
//!
//! Provides a unified error type for all API endpoints with structured error variants.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use faceid_core::PipelineError;
use thiserror::Error;

/// API error type with structured variants for different error categories
#[derive(Debug, Error)]
pub enum ApiError {
    /// Bad request - client provided invalid input
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Payload too large - upload or download exceeded the image ceiling
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// Request timeout - a remote image did not arrive in time
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Internal server error - unexpected server-side failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// Pipeline error - outcome of an enroll/verify/delete/extract call
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

impl ApiError {
    /// Create a bad request error
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::PayloadTooLarge(message.into())
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Create an internal server error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Pipeline(ref e) => match e {
                // Client-provided invalid input → 400
                PipelineError::DecodeFailed
                | PipelineError::InvalidLabel(_)
                | PipelineError::InvalidThreshold(_) => StatusCode::BAD_REQUEST,

                // Image decoded but the face policy rejected it → 422
                PipelineError::NoFaceDetected | PipelineError::MultipleFacesDetected { .. } => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }

                PipelineError::NotFound(_) => StatusCode::NOT_FOUND,

                // Store down; the client may retry → 503
                PipelineError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,

                PipelineError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Get the error code for programmatic error handling
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "INVALID_INPUT",
            Self::PayloadTooLarge(_) => "IMAGE_TOO_LARGE",
            Self::Timeout(_) => "TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Pipeline(ref e) => match e {
                PipelineError::DecodeFailed => "DECODE_FAILED",
                PipelineError::NoFaceDetected => "NO_FACE_DETECTED",
                PipelineError::MultipleFacesDetected { .. } => "MULTIPLE_FACES_DETECTED",
                PipelineError::InvalidLabel(_) => "INVALID_LABEL",
                PipelineError::InvalidThreshold(_) => "INVALID_THRESHOLD",
                PipelineError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
                PipelineError::NotFound(_) => "IDENTITY_NOT_FOUND",
                PipelineError::Unexpected(_) => "INTERNAL_ERROR",
            },
        }
    }

    /// Get sanitized error message for client response
    fn client_message(&self) -> String {
        match self {
            Self::Pipeline(ref e) => match e {
                PipelineError::StoreUnavailable(_) => {
                    "Identity store unavailable, retry later".to_string()
                }
                PipelineError::Unexpected(_) => "Unexpected server error".to_string(),
                // The remaining variants only carry client-supplied values
                other => other.to_string(),
            },
            Self::Internal(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Get the error category for logging
    fn error_category(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal",
            Self::Pipeline(_) => "pipeline",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let category = self.error_category();
        let code = self.error_code();
        let internal_message = self.to_string();
        let client_message = self.client_message();

        // Log based on severity, always including internal details
        if status.is_server_error() {
            tracing::error!(
                status = %status,
                category = category,
                code = code,
                error = %internal_message,
                "Server error"
            );
        } else {
            tracing::warn!(
                status = %status,
                category = category,
                code = code,
                error = %internal_message,
                "Client error"
            );
        }

        // All error responses include a `code` field for programmatic error handling
        let body = serde_json::json!({
            "error": client_message,
            "code": code,
        });

        (status, Json(body)).into_response()
    }
}
