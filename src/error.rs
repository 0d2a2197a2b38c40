//! Error types for irgauge
//!
//! Each failure class gets its own enum so callers can tell a rejected
//! packet field apart from a broken config file or a dropped connection:
//!
//! - [`ValidationError`]: a packet field is out of range
//! - [`ConfigurationError`]: calibration table or config file is unusable
//! - [`ProtocolError`]: a control-channel line could not be understood
//! - [`ClientError`]: client session failures (transport, fatal disconnect)
//! - [`TransmitError`]: the hardware emitter failed

use std::path::PathBuf;
use thiserror::Error;

/// A packet field outside its bit-width range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Command must fit in 4 bits
    #[error("invalid command {0} (expected 0..=15)")]
    CommandOutOfRange(i64),

    /// Value must fit in 12 bits
    #[error("invalid value {0} (expected 0..=4095)")]
    ValueOutOfRange(i64),

    /// Address must fit in 8 bits
    #[error("invalid address {0} (expected 0..=255)")]
    AddressOutOfRange(i64),

    /// Gauge values go through calibration and must be real numbers
    #[error("gauge value must be a finite number")]
    NonFiniteValue,
}

impl ValidationError {
    /// Name of the offending packet field
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::CommandOutOfRange(_) => "command",
            ValidationError::ValueOutOfRange(_) | ValidationError::NonFiniteValue => "value",
            ValidationError::AddressOutOfRange(_) => "address",
        }
    }
}

/// Configuration that cannot be used
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Calibration table has no anchor points
    #[error("calibration table is empty")]
    EmptyCalibrationTable,

    /// Display values must never decrease
    #[error("calibration table is not monotonic at index {index}")]
    NonMonotonicCalibration { index: usize },

    /// NaN or infinite anchor
    #[error("calibration table has a non-finite entry at index {index}")]
    NonFiniteCalibration { index: usize },

    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or type error
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// Semantically invalid setting
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A control-channel line the daemon could not act on
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// `cmd` discriminator is not one we know
    #[error("unrecognized command '{0}'")]
    UnknownCommand(String),

    /// Not JSON, missing `cmd`, or missing a required field
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Client session failures
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket read/write failed; the session reconnects on its own
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// No application-level connection to the daemon right now
    #[error("not connected to daemon")]
    NotConnected,

    /// Daemon sent `__disconnect`; this client must stop
    #[error("daemon requested disconnect")]
    Terminated,

    /// Value or command rejected before anything was sent
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ClientError {
    /// Whether the error is a transient transport problem
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::NotConnected)
    }
}

/// Hardware emitter failure
#[derive(Debug, Error)]
pub enum TransmitError {
    /// Emitter program could not be started
    #[error("failed to run emitter {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Emitter program ran but reported failure
    #[error("emitter {program} exited with status {code:?}")]
    Failed { program: PathBuf, code: Option<i32> },

    /// Any other backend failure
    #[error("transmit failed: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_field() {
        assert_eq!(ValidationError::CommandOutOfRange(16).field(), "command");
        assert_eq!(ValidationError::ValueOutOfRange(4096).field(), "value");
        assert_eq!(ValidationError::AddressOutOfRange(-1).field(), "address");
        assert_eq!(ValidationError::NonFiniteValue.field(), "value");
    }

    #[test]
    fn test_validation_error_message() {
        let err = ValidationError::ValueOutOfRange(5000);
        assert_eq!(err.to_string(), "invalid value 5000 (expected 0..=4095)");
    }

    #[test]
    fn test_client_error_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(ClientError::Transport(io).is_transient());
        assert!(ClientError::NotConnected.is_transient());
        assert!(!ClientError::Terminated.is_transient());
        assert!(!ClientError::Validation(ValidationError::CommandOutOfRange(20)).is_transient());
    }

    #[test]
    fn test_protocol_error_message() {
        let err = ProtocolError::UnknownCommand("frobnicate".to_string());
        assert_eq!(err.to_string(), "unrecognized command 'frobnicate'");
    }
}
