//! Common error types for Keylock.

use thiserror::Error;

/// Top-level error type for Keylock operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Wrong password or failed authentication tag.
    ///
    /// Never carries detail: a wrong password and tampered data look the same.
    #[error("Authentication failed")]
    AuthFailure,

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Dump file structure or version is unreadable.
    #[error("Corrupt format: {0}")]
    CorruptFormat(String),

    /// Operation attempted before the session authenticated.
    #[error("Unauthorized")]
    Unauthorized,

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record could not be decrypted.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Cryptographic operation failed for a reason other than authentication.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The peer violated the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the caller may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
