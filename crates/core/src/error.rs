//! Core error type

use thiserror::Error;

/// Errors from the core vocabulary layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A persisted status character that is not one of the ten known codes.
    #[error("unknown transaction status code '{0}'")]
    UnknownStatus(char),

    /// A wire-form envelope that does not match `[code, message, payload, extra]`.
    #[error("malformed response envelope: {0}")]
    BadEnvelope(String),
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
