//! Error handling module
//!
//! Defines the error types for the routing middleware with HTTP status code
//! mapping for the error surfaces a request can hit.

use hyper::StatusCode;
use thiserror::Error;

/// Main error type for the middleware.
#[derive(Error, Debug)]
pub enum ForkliftError {
    // Configuration errors (fail construction, never reach a request)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("missing defaultBackend")]
    MissingDefaultBackend,

    #[error("invalid percentage {value}: must be between 0 and 100")]
    InvalidPercentage { value: f64 },

    #[error("invalid backend URL '{url}': {reason}")]
    BackendUrl { url: String, reason: String },

    // Request-path errors
    #[error("session id generation failed: {0}")]
    SessionGeneration(String),

    #[error("failed to build proxy request: {0}")]
    RequestConstruction(String),

    #[error("error reading request body: {0}")]
    Body(String),

    #[error("upstream request to {url} failed: {reason}")]
    Upstream { url: String, reason: String },

    #[error("upstream request to {url} timed out after {timeout_ms}ms")]
    UpstreamTimeout { url: String, timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

impl ForkliftError {
    /// Map an error to the HTTP status code its response carries.
    ///
    /// Dispatch failures surface as 502; everything else that can occur
    /// while a request is in flight is an internal error.
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            ForkliftError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ForkliftError::UpstreamTimeout { .. } => StatusCode::BAD_GATEWAY,

            ForkliftError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ForkliftError::MissingDefaultBackend => StatusCode::INTERNAL_SERVER_ERROR,
            ForkliftError::InvalidPercentage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ForkliftError::BackendUrl { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ForkliftError::SessionGeneration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ForkliftError::RequestConstruction(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ForkliftError::Body(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ForkliftError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ForkliftError::AddrParse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
