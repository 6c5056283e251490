//! Error types for the Yari library.
//!
//! This module provides comprehensive error handling for all Yari operations.
//! All errors are represented by the [`YariError`] enum, which provides
//! detailed information about what went wrong.
//!
//! # Examples
//!
//! ```
//! use yari::error::{Result, YariError};
//!
//! fn example_operation() -> Result<()> {
//!     // Return an error
//!     Err(YariError::index("Invalid input"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use anyhow;
use thiserror::Error;

/// The main error type for Yari operations.
///
/// This enum represents all possible errors that can occur in the Yari library.
/// It uses the `thiserror` crate for automatic `Error` trait implementation and
/// provides convenient constructor methods for creating specific error types.
#[derive(Error, Debug)]
pub enum YariError {
    /// I/O errors (file operations, spills, merges, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Detected corruption: a checksum trailer did not match the stream
    /// content, or a file is truncated. Non-retryable.
    #[error("Corrupted index data: {0}")]
    Corruption(String),

    /// Codec name or version mismatch on open. Distinct from corruption,
    /// since it may indicate a legitimate newer or older format.
    #[error("Format mismatch: {0}")]
    Format(String),

    /// Index-related errors (invalid arguments at the indexing boundary)
    #[error("Index error: {0}")]
    Index(String),

    /// Invalid operation (lifecycle misuse, e.g. writing after close)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Programming-invariant violation. These abort the current operation
    /// instead of being silently skipped.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with YariError.
pub type Result<T> = std::result::Result<T, YariError>;

impl YariError {
    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        YariError::Storage(msg.into())
    }

    /// Create a new corruption error.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        YariError::Corruption(msg.into())
    }

    /// Create a new format mismatch error.
    pub fn format<S: Into<String>>(msg: S) -> Self {
        YariError::Format(msg.into())
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        YariError::Index(msg.into())
    }

    /// Create a new invalid operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        YariError::InvalidOperation(msg.into())
    }

    /// Create a new internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        YariError::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = YariError::index("Test index error");
        assert_eq!(error.to_string(), "Index error: Test index error");

        let error = YariError::storage("Test storage error");
        assert_eq!(error.to_string(), "Storage error: Test storage error");

        let error = YariError::corruption("bad checksum");
        assert_eq!(error.to_string(), "Corrupted index data: bad checksum");

        let error = YariError::format("version 3 not in [0..0]");
        assert_eq!(error.to_string(), "Format mismatch: version 3 not in [0..0]");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let yari_error = YariError::from(io_error);

        match yari_error {
            YariError::Io(_) => {} // Expected
            _ => panic!("Expected IO error variant"),
        }
    }

    #[test]
    fn test_corruption_distinct_from_format() {
        let corruption = YariError::corruption("x");
        let format = YariError::format("x");
        assert!(matches!(corruption, YariError::Corruption(_)));
        assert!(matches!(format, YariError::Format(_)));
    }
}
