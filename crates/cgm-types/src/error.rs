//! Error types for data parsing in cgm-types.

use thiserror::Error;

/// Errors that can occur when decoding sensor identity or memory contents.
///
/// This error type is transport-agnostic and does not include
/// connection errors (those belong in cgm-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Not enough bytes to decode the structure.
    #[error("Insufficient bytes: requires {expected} bytes, got {actual}")]
    InsufficientBytes {
        /// Number of bytes required.
        expected: usize,
        /// Number of bytes supplied.
        actual: usize,
    },

    /// A field held a value outside its valid domain.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Checksum embedded in the data did not match its contents.
    #[error("Checksum mismatch: expected {expected:#06X}, got {actual:#06X}")]
    ChecksumMismatch {
        /// Checksum stored in the data.
        expected: u16,
        /// Checksum computed over the data.
        actual: u16,
    },
}

/// Result type alias using cgm-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
