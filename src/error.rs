//! Error types for ztgate

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for ztgate
pub type Result<T> = std::result::Result<T, Error>;

/// ztgate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Issuance requested while no CA is active
    #[error("No active certificate authority")]
    NoActiveCa,

    /// CA id not known
    #[error("Certificate authority not found: {0}")]
    CaNotFound(String),

    /// CA lifecycle transition not allowed from the current status
    #[error("Invalid CA transition for {id}: {reason}")]
    InvalidCaTransition {
        /// CA id
        id: String,
        /// Why the transition was rejected
        reason: String,
    },

    /// Certificate serial not known
    #[error("Certificate not found: {0}")]
    CertificateNotFound(String),

    /// Key generation, signing or certificate parsing failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Agent or bearer token not recognised
    #[error("Unknown token")]
    UnknownToken,

    /// Generic lookup miss (enforcement point, identity, ...)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Control plane answered with an error status
    #[error("Control plane error: {0}")]
    ControlPlane(String),

    /// Packet-filter or route backend failure
    #[error("Firewall backend error: {0}")]
    Firewall(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status used when this error terminates a control-plane request.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownToken => StatusCode::UNAUTHORIZED,
            Self::CaNotFound(_) | Self::CertificateNotFound(_) | Self::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::InvalidCaTransition { .. } => StatusCode::CONFLICT,
            Self::Config(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::NoActiveCa => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable code for JSON error bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "invalid_config",
            Self::NoActiveCa => "no_active_ca",
            Self::CaNotFound(_) => "ca_not_found",
            Self::InvalidCaTransition { .. } => "invalid_ca_transition",
            Self::CertificateNotFound(_) => "certificate_not_found",
            Self::UnknownToken => "unknown_token",
            Self::NotFound(_) => "not_found",
            Self::Json(_) => "invalid_request",
            _ => "internal_error",
        }
    }
}
