//! Error types for cgm-core.
//!
//! # Severity
//!
//! Every error classifies itself with [`Error::severity`]:
//!
//! | Error | Severity | Recovery |
//! |-------|----------|----------|
//! | [`Error::Decrypt`] | Recoverable | Reset the reassembler, keep listening |
//! | [`Error::InvalidData`] | Recoverable | Drop the frame, keep listening |
//! | [`Error::Timeout`] | Session-fatal | Disconnect; the user reconnects |
//! | [`Error::Transport`] | Session-fatal | Disconnect; the user reconnects |
//! | [`Error::ServiceNotFound`] | Session-fatal | Disconnect; wrong peripheral or firmware |
//! | [`Error::CharacteristicNotFound`] | Session-fatal | Disconnect |
//! | [`Error::Auth`] | Pairing-fatal | Pair again |
//! | [`Error::NotPaired`] | Pairing-fatal | Pair first |
//!
//! Nothing here crosses the dispatch boundary as a panic or `Err`: the
//! connection state machine converts errors into `SetConnectionError`
//! actions, with `is_critical` taken from [`Error::is_critical`].

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the acquisition pipeline.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The transport failed or the link dropped.
    #[error("Transport error: {reason}")]
    Transport {
        /// Description reported by the transport.
        reason: String,
    },

    /// The sensor service was not found on the peripheral.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The service UUID.
        uuid: String,
    },

    /// A required characteristic was not found on the peripheral.
    #[error("Characteristic not found: {uuid} (searched {searched} characteristics)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of characteristics that were discovered.
        searched: usize,
    },

    /// Sensor identity is malformed; the unlock payload cannot be built.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Frame could not be decrypted (wrong key or corrupted data).
    #[error("Decrypt error: {0}")]
    Decrypt(String),

    /// Operation attempted while not connected.
    #[error("Not connected to sensor")]
    NotConnected,

    /// Operation requires a paired sensor.
    #[error("No sensor paired")]
    NotPaired,

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Data received from the sensor was malformed.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Byte-level parse failure.
    #[error(transparent)]
    Parse(#[from] cgm_types::ParseError),

    /// Persisting state failed.
    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// How far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// The session continues.
    Recoverable,
    /// The current session ends; the sensor stays paired.
    SessionFatal,
    /// Pairing must be redone.
    PairingFatal,
}

impl Error {
    /// Create a transport error.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Create a service not found error.
    pub fn service_not_found(uuid: impl ToString) -> Self {
        Self::ServiceNotFound {
            uuid: uuid.to_string(),
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl ToString, searched: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.to_string(),
            searched,
        }
    }

    /// Create a decrypt error.
    pub fn decrypt(message: impl Into<String>) -> Self {
        Self::Decrypt(message.into())
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Classify this error.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Error::Decrypt(_) | Error::InvalidData(_) | Error::Parse(_) => Severity::Recoverable,
            Error::Persistence(_) | Error::Cancelled | Error::InvalidConfig(_) => {
                Severity::Recoverable
            }
            Error::Transport { .. }
            | Error::ServiceNotFound { .. }
            | Error::CharacteristicNotFound { .. }
            | Error::NotConnected
            | Error::Timeout { .. } => Severity::SessionFatal,
            Error::Auth(_) | Error::NotPaired => Severity::PairingFatal,
        }
    }

    /// Whether the error ends the current session.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.severity() != Severity::Recoverable
    }

    /// Whether the link itself failed, so a fresh connection may succeed.
    #[must_use]
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::Timeout { .. } | Error::NotConnected
        )
    }
}

/// Result type alias using cgm-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
