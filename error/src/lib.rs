//! Underlying error types used over the primordia pipeline.
//!
//! Errors carry a [`ErrorKind`] so callers can branch on the failure class
//! without downcasting. Kinds are deliberately coarse; the human-readable
//! reason string carries the detail.

use derive_more::Display;
use std::fmt;
use thiserror::Error;

/// A list specifying the categories of primordia errors.
///
/// This list is intended to grow over time and it is not recommended to
/// exhaustively match against it.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Display)]
pub enum ErrorKind {
    /// The configuration failed validation and prevents startup
    ConfigInvalid,
    /// A required resource binding could not be resolved or has gone away
    ResourceUnavailable,
    /// A producer timed out while waiting for queue capacity
    BackpressureTimeout,
    /// Writing a batch to storage failed, the batch will be redelivered
    BatchWriteFailed,
    /// Publishing a batch notification failed, best effort only
    NotificationSendFailed,
    /// The broker drain token could not be acquired within the timeout
    TokenAcquireFailed,
    /// The broker drain token could not be released, fatal for that broker
    TokenReleaseFailed,
    /// A queued payload could not be decoded
    DeserializationFailed,
    /// A single organism instruction failed, non-fatal for the tick
    InstructionFailed,
    /// A plugin hook failed, non-fatal for the tick
    PluginFailed,
    /// An already-processed chunk was delivered again, informational
    DuplicateDetected,
    /// Unclassified internal error
    Internal,
}

/// The pipeline error, an [`ErrorKind`] plus a reason.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}({reason})")]
pub struct Error {
    kind: ErrorKind,
    reason: String,
}

impl Error {
    /// Returns the kind this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the reason string.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Whether the error is of the given kind.
    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl ErrorKind {
    /// Creates an error of this kind with only a string as the reason.
    pub fn other<T>(self, reason: T) -> Error
    where
        T: fmt::Display,
    {
        Error {
            kind: self,
            reason: reason.to_string(),
        }
    }

    /// Creates an error of this kind wrapping an underlying error.
    pub fn because<E>(self, source: E) -> Error
    where
        E: std::error::Error,
    {
        self.other(source.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        ErrorKind::Internal.because(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_reason() {
        let err = ErrorKind::BackpressureTimeout.other("queue full after 5s");
        assert_eq!(err.to_string(), "BackpressureTimeout(queue full after 5s)");
        assert!(err.is_kind(ErrorKind::BackpressureTimeout));
    }

    #[test]
    fn io_errors_map_to_internal() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err: Error = io.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
