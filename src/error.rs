//! Error types for certificate minting and request forwarding

use hyper::StatusCode;
use std::time::Duration;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures of the certificate authority engine and the domain certificate cache.
#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Certificate authority has no private key")]
    MissingPrivateKey,

    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    #[error("Certificate archive error: {0}")]
    Archive(String),
}

impl CertificateError {
    pub fn key_generation(msg: impl Into<String>) -> Self {
        CertificateError::KeyGeneration(msg.into())
    }

    pub fn signing(msg: impl Into<String>) -> Self {
        CertificateError::Signing(msg.into())
    }

    pub fn archive(msg: impl Into<String>) -> Self {
        CertificateError::Archive(msg.into())
    }
}

/// Failures of a single forward operation.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Request carries no host to forward to")]
    MissingHost,

    #[error("Invalid upstream target: {0}")]
    InvalidTarget(String),

    #[error("Failed to connect to {origin}: {source}")]
    Connect {
        origin: String,
        #[source]
        source: BoxError,
    },

    #[error("Upstream {origin} failed: {source}")]
    Upstream {
        origin: String,
        #[source]
        source: BoxError,
    },

    #[error("Upstream {origin} did not respond within {timeout:?}")]
    Timeout { origin: String, timeout: Duration },

    #[error("Forwarding was cancelled")]
    Cancelled,
}

impl ForwardError {
    pub fn invalid_target(msg: impl Into<String>) -> Self {
        ForwardError::InvalidTarget(msg.into())
    }

    /// Status returned to the client when no response has been committed yet.
    ///
    /// `None` for cancellation: nothing is written to an aborted connection.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            ForwardError::MissingHost | ForwardError::InvalidTarget(_) => {
                Some(StatusCode::BAD_REQUEST)
            }
            ForwardError::Connect { .. } | ForwardError::Upstream { .. } => {
                Some(StatusCode::BAD_GATEWAY)
            }
            ForwardError::Timeout { .. } => Some(StatusCode::GATEWAY_TIMEOUT),
            ForwardError::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ForwardError::Cancelled)
    }
}
