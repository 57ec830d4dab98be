//! Error type shared by every layer of the compute core.
//!
//! Errors carry a machine-readable [`ErrorKind`] and a human message. There are
//! no silent fallbacks: a missing feature surfaces as
//! [`ErrorKind::UnsupportedFeature`], never as a degraded success.

use std::fmt;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The device or backend cannot perform the requested feature
    UnsupportedFeature,
    /// A parameter is malformed or does not match a declared contract
    InvalidArgument,
    /// Device or host memory is exhausted
    OutOfMemory,
    /// The backend or driver reported a failure
    DriverFailure,
    /// The caller broke an API contract (e.g. mixing contexts)
    ContractViolation,
    /// A bounded wait expired
    Timeout,
    /// A named entity (backend, device, entry point) does not exist
    NotFound,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UnsupportedFeature => "unsupported feature",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::DriverFailure => "driver failure",
            ErrorKind::ContractViolation => "contract violation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error with a kind and a diagnostic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedFeature, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OutOfMemory, message)
    }

    pub fn driver(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DriverFailure, message)
    }

    pub fn contract(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ContractViolation, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_message() {
        let err = Error::unsupported("cube images");
        assert_eq!(err.kind(), ErrorKind::UnsupportedFeature);
        assert_eq!(err.to_string(), "unsupported feature: cube images");
    }

    #[test]
    fn test_constructors_map_to_kinds() {
        assert_eq!(Error::invalid_argument("x").kind(), ErrorKind::InvalidArgument);
        assert_eq!(Error::out_of_memory("x").kind(), ErrorKind::OutOfMemory);
        assert_eq!(Error::driver("x").kind(), ErrorKind::DriverFailure);
        assert_eq!(Error::contract("x").kind(), ErrorKind::ContractViolation);
        assert_eq!(Error::timeout("x").kind(), ErrorKind::Timeout);
        assert_eq!(Error::not_found("x").kind(), ErrorKind::NotFound);
    }
}
