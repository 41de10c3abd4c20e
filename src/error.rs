//! Error types for dock-dns.

use thiserror::Error;

use crate::tsig::TsigError;

/// Errors that can occur in the DNS server.
#[derive(Debug, Error)]
pub enum DnsError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error talking to the Docker Engine API
    #[error("Docker HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP error on the Docker unix socket
    #[error("Docker socket error: {0}")]
    Hyper(#[from] hyper::Error),

    /// The Docker Engine API answered with a non-success status
    #[error("Docker API returned {status}: {message}")]
    DockerApi {
        /// HTTP status code.
        status: u16,
        /// Body of the error response.
        message: String,
    },

    /// Malformed JSON from the Docker Engine API
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// TSIG key or signature error
    #[error("TSIG error: {0}")]
    Tsig(#[from] TsigError),

    /// Failed to parse address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}
