//! Error types for EmberDB

use thiserror::Error;

/// Result type alias for EmberDB operations
pub type Result<T> = std::result::Result<T, EmberError>;

/// EmberDB error types
#[derive(Error, Debug)]
pub enum EmberError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Requested item does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

impl EmberError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmberError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            EmberError::Corruption(_) | EmberError::ChecksumMismatch { .. }
        )
    }

    /// Check if error is a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, EmberError::NotFound(_))
    }
}
