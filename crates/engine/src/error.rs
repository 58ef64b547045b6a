//! Engine error types
//!
//! Two kinds of failure leave this crate. `EngineError` is the
//! constructor's: opening the store (including the fatal incompatible-
//! schema case) or taking the recovery lock. Everything after construction
//! is a `LoopError`, which carries the envelope status code it will be
//! reported under, so that resolution failures (400/412/500) keep their
//! codes through rollback annotation while callee and environment failures
//! surface as 532.

use rewind_concurrency::LockError;
use rewind_core::{codes, Envelope};
use rewind_storage::StoreError;
use thiserror::Error;

/// Failure while constructing a manager.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Store failure; the schema-version variants are the one
    /// non-recoverable error in the system.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Could not take the recovery lock.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Filesystem failure outside the store (e.g. creating the temporary
    /// data directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No data directory was configured and `HOME` is not set.
    #[error("no data directory configured and HOME is not set")]
    NoDataDir,

    /// No function registry was configured.
    #[error("no function registry configured")]
    NoRegistry,
}

/// Failure inside an operation, carrying its envelope status code.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct LoopError {
    /// Envelope status code this failure reports under.
    pub code: u16,
    /// Human-readable message; rollback annotations are appended here.
    pub message: String,
}

impl LoopError {
    /// A failure with an explicit code.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        LoopError {
            code,
            message: message.into(),
        }
    }

    /// An environmental (532) failure.
    pub fn env(message: impl Into<String>) -> Self {
        LoopError::new(codes::ENVIRONMENT, message)
    }

    /// Convert into the envelope the facade returns.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(self.code, self.message.clone())
    }
}

impl From<StoreError> for LoopError {
    fn from(e: StoreError) -> Self {
        LoopError::env(format!("database error: {}", e))
    }
}

impl From<LockError> for LoopError {
    fn from(e: LockError) -> Self {
        LoopError::env(e.to_string())
    }
}
