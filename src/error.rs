//! Error types for rilldb.

use std::io;
use thiserror::Error;

/// Result type alias for rilldb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the write path and block layer.
///
/// Errors are cloneable so a group leader can assign one status to every
/// member of a write group.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// I/O error surfaced from the append sink.
    #[error("I/O error: {0}")]
    Io(String),

    /// Data corruption detected.
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// Operation could not run to completion (e.g. admission control
    /// rejected a `no_slowdown` writer during a write stall).
    #[error("Incomplete: {0}")]
    Incomplete(String),

    /// Operation is not valid for the target (e.g. `seek_for_prev` on an
    /// index block iterator).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error (should not happen).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Create a corruption error with the given message.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }

    /// Create an incomplete error with the given message.
    pub fn incomplete<S: Into<String>>(msg: S) -> Self {
        Error::Incomplete(msg.into())
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Check if this error indicates corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_) | Error::CrcMismatch { .. })
    }

    /// Check if this error is an admission-control rejection.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::Incomplete(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::corruption("bad varint");
        assert_eq!(format!("{}", err), "Corruption detected: bad varint");

        let err = Error::incomplete("Write stall");
        assert_eq!(format!("{}", err), "Incomplete: Write stall");
    }

    #[test]
    fn test_error_is_corruption() {
        assert!(Error::corruption("bad").is_corruption());
        assert!(Error::CrcMismatch {
            expected: 1,
            actual: 2
        }
        .is_corruption());
        assert!(!Error::incomplete("stall").is_corruption());
    }

    #[test]
    fn test_error_is_incomplete() {
        assert!(Error::incomplete("Write stall").is_incomplete());
        assert!(!Error::corruption("bad").is_incomplete());
    }
}
