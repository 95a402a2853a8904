//! Error handling for mirrorcast

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
///
/// Recoverable errors permit `RecoverError` to re-enter address discovery.
/// The rest force the `Error` state until the user intervenes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize)]
pub enum Error {
    /// No usable local address after discovery retries
    #[error("No usable network address found")]
    AddressNotFound,

    /// Server port already bound by another process
    #[error("Server address already in use")]
    AddressInUse,

    /// Screen capture permission rejected or the token was stale
    #[error("Screen capture permission rejected: {0}")]
    CastSecurity(String),

    /// Unexpected failure inside the HTTP routing layer
    #[error("HTTP server error: {0}")]
    HttpServer(String),

    /// A background task died unexpectedly
    #[error("Background task failure: {0}")]
    TaskFailure(String),

    /// The orchestrator event channel overflowed
    #[error("Event channel exhausted")]
    ChannelExhausted,

    /// The capture pipeline stopped producing frames
    #[error("Screen capture failed: {0}")]
    CaptureFailed(String),
}

impl Error {
    /// Whether `RecoverError` may re-attempt address discovery for this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::AddressNotFound | Error::AddressInUse | Error::CastSecurity(_)
        )
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            Error::AddressNotFound => (StatusCode::SERVICE_UNAVAILABLE, "ADDRESS_NOT_FOUND"),
            Error::AddressInUse => (StatusCode::SERVICE_UNAVAILABLE, "ADDRESS_IN_USE"),
            Error::CastSecurity(_) => (StatusCode::FORBIDDEN, "CAST_SECURITY"),
            Error::HttpServer(_) => (StatusCode::INTERNAL_SERVER_ERROR, "HTTP_SERVER_ERROR"),
            Error::TaskFailure(_) => (StatusCode::INTERNAL_SERVER_ERROR, "TASK_FAILURE"),
            Error::ChannelExhausted => (StatusCode::INTERNAL_SERVER_ERROR, "CHANNEL_EXHAUSTED"),
            Error::CaptureFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CAPTURE_FAILED"),
        };

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %self,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": self.to_string()
        }));

        (status, body).into_response()
    }
}
