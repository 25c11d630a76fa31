//! Error types for the benchlink library.
//!
//! One structured enum covers the whole crate: transport and handshake
//! failures, codec errors, and faults marshaled back from a remote target.
//! Remote faults are carried as tagged data ({class, message, traceback})
//! rather than reconstructed as concrete local types, so callers match on
//! the variant instead of downcasting.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the benchlink library.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("decode error at byte {offset}: {message}")]
    Decode { offset: usize, message: String },

    #[error("envelope exceeds {limit} bytes")]
    EnvelopeTooLarge { limit: usize },

    #[error("handshake failed: {message}")]
    Handshake { message: String },

    #[error("no such remote method: {method}")]
    UnknownMethod { method: String },

    #[error("remote call raised {class}: {message}")]
    RemoteFault {
        class: String,
        message: String,
        traceback: String,
    },

    #[error("value is not serializable: {message}")]
    Unserializable { message: String },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("connection is no longer usable: {message}")]
    Dead { message: String },

    #[error("TLS error: {message}")]
    Tls {
        message: String,
        #[source]
        source: Option<rustls::Error>,
    },

    #[error("background task '{name}' failed: {message}")]
    Task { name: String, message: String },
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Tls {
            message: err.to_string(),
            source: Some(err),
        }
    }
}
