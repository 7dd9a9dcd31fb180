//! Status taxonomy and the crate-wide error type.
//!
//! Nothing here panics or throws across an API boundary: every fallible
//! operation returns a [`Result`], and [`StatusSeverity`]/[`StatusCode`] are
//! the vocabulary a [`crate::state::GlobalState`] status callback is given.

use std::fmt;

/// Severity of a status record, ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatusSeverity {
    Fatal,
    Error,
    Warning,
    Performance,
    Info,
    Debug,
}

impl fmt::Display for StatusSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Warning => "WARNING",
            Self::Performance => "PERFORMANCE",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
        };
        f.write_str(s)
    }
}

/// Coarse machine-readable status code accompanying a [`StatusSeverity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    NoError,
    UnknownError,
    InvalidArgument,
    InvalidOperation,
    OutOfMemory,
    UnsupportedDevice,
    VersionMismatch,
}

/// A single diagnostic produced by the runtime and handed to the device's
/// status callback.
#[derive(Debug, Clone)]
pub struct StatusRecord {
    pub severity: StatusSeverity,
    pub code: StatusCode,
    pub message: String,
}

impl StatusRecord {
    pub fn new(severity: StatusSeverity, code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
        }
    }
}

/// Errors surfaced by fallible entry points in this crate.
///
/// Per the propagation policy: a call that triggers one of these still
/// completes its forwarding to the backend whenever it is safe to do so.
/// Validation is diagnostic, not gating.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown handle")]
    UnknownHandle,
    #[error("handle has already been released")]
    ReleasedHandle,
    #[error("unknown subtype '{0}'")]
    UnknownSubtype(String),
    #[error("type mismatch for parameter '{name}': expected {expected:?}, got {found:?}")]
    ParamTypeMismatch {
        name: String,
        expected: crate::value::DataType,
        found: crate::value::DataType,
    },
    #[error("property buffer too small: need {needed} bytes, got {available}")]
    PropertyBufferTooSmall { needed: usize, available: usize },
    #[error("array parameter is not currently mapped")]
    NotMapped,
    #[error("commit/finalize flush did not reach a fixed point within {0} iterations")]
    CommitCycle(u32),
    #[error("backend device could not be constructed: {0}")]
    Fatal(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// The `(severity, code)` pair a [`StatusRecord`] for this error should carry.
    pub fn status(&self) -> (StatusSeverity, StatusCode) {
        match self {
            Error::UnknownHandle | Error::ReleasedHandle => {
                (StatusSeverity::Error, StatusCode::InvalidArgument)
            }
            Error::UnknownSubtype(_) => (StatusSeverity::Error, StatusCode::InvalidArgument),
            Error::ParamTypeMismatch { .. } => {
                (StatusSeverity::Error, StatusCode::InvalidArgument)
            }
            Error::PropertyBufferTooSmall { .. } => {
                (StatusSeverity::Error, StatusCode::InvalidArgument)
            }
            Error::NotMapped => (StatusSeverity::Error, StatusCode::InvalidOperation),
            Error::CommitCycle(_) => (StatusSeverity::Warning, StatusCode::InvalidOperation),
            Error::Fatal(_) => (StatusSeverity::Fatal, StatusCode::UnsupportedDevice),
            Error::InvalidArgument(_) => (StatusSeverity::Error, StatusCode::InvalidArgument),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
