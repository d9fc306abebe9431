//! Error types for the server surfaces.
//!
//! [`ApiError`] renders a [`GatewayError`] as the JSON failure envelope
//! with the matching HTTP status. [`TransportError`] covers the socket
//! surfaces (RPC and columnar), which report per-request failures inside
//! their own frames and only surface connection-level problems here.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use modelgate_core::config::ConfigError;
use modelgate_core::error::GatewayError;
use thiserror::Error;

/// REST-facing wrapper around [`GatewayError`].
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.to_status())).into_response()
    }
}

/// Connection-level failures on the socket surfaces.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Frame larger than the configured message limit.
    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Connection closed by peer")]
    Closed,
}

/// Result type alias for socket surfaces.
pub type TransportResult<T> = Result<T, TransportError>;

/// Failures while assembling the gateway at startup.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
