//! Error types for the storage crate.

use thiserror::Error;

pub use mtc_core::error::Error as CoreError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Requested start sequence is newer than anything retained.
    #[error("Sequence {requested} is beyond the newest retained sequence {last}")]
    SequenceOutOfRange { requested: u64, last: u64 },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<Error> for CoreError {
    fn from(e: Error) -> Self {
        match e {
            Error::SequenceOutOfRange { .. } => CoreError::Storage(e.to_string()),
            Error::InvalidInput(s) => CoreError::Validation(s),
        }
    }
}
