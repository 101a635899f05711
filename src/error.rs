//! Error types for graphite-relay

use thiserror::Error;

/// Main error type for relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("configuration error at line {line}, column {column}: {message}")]
    ConfigParse {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("invalid configuration: {message}")]
    ConfigInvalid { message: String },

    #[error("cannot bind listener on {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("invalid pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    #[error("TLS setup failed: {message}")]
    Tls { message: String },

    #[error("relay has already been started")]
    AlreadyStarted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
