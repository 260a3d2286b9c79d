//! Error types for tstore.

use std::io;
use thiserror::Error;

/// Result type alias for tstore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for store and pipeline operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error from file operations.
    #[error("I/O error: {0}")]
    Io(String),

    /// Data corruption detected.
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Invalid file format or magic number.
    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    /// CRC checksum mismatch in the record-info sidecar.
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// An operator requiring sorted input was fed an unsorted source.
    #[error("Input not sorted: {0}")]
    NotSorted(String),

    /// A record arrived out of order at a writer declared sorted.
    #[error("Key out of order: {0}")]
    KeyOutOfOrder(String),

    /// Record number outside the store's logical range.
    #[error("Record number out of range: {record_no} (count: {count})")]
    RecordOutOfRange { record_no: i64, count: i64 },

    /// The disk-access worker thread died and must be restarted.
    #[error("Disk worker dead: {0}")]
    WorkerDead(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A record kind does not support the requested operation.
    #[error("Unsupported record kind: {0}")]
    UnsupportedKind(String),

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

    /// Create an invalid format error.
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Error::InvalidFormat(msg.into())
    }

    /// Create a not-sorted error.
    pub fn not_sorted<S: Into<String>>(msg: S) -> Self {
        Error::NotSorted(msg.into())
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Check if this error indicates corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corruption(_) | Error::CrcMismatch { .. } | Error::InvalidFormat(_)
        )
    }
}
