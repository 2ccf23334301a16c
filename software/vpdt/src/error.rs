//! Error types for the protocol stack.
//!
//! Nothing here is process-fatal: frame errors mean "drop the datagram",
//! timeouts and device rejections are reported to the immediate caller,
//! and validation errors are refused before anything reaches the wire.

use std::time::Duration;

use vpdt_shared::frame::FrameError;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket-level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A reply datagram could not be interpreted
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// No matching reply arrived within the window; callers decide
    /// whether to retry
    #[error("no matching reply within {0:?}")]
    Timeout(Duration),

    /// The device answered with a non-zero status
    #[error("device rejected {op}: status {flag}")]
    Action { op: String, flag: u16 },

    /// A caller-supplied parameter violates a precondition; nothing was
    /// sent to the wire
    #[error("invalid parameter: {0}")]
    Validation(String),

    /// No inbox exists for this device identity
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The dispatch engine's background tasks are not running
    #[error("dispatch engine is not running")]
    NotListening,
}

impl Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub(crate) fn action(op: impl Into<String>, flag: u16) -> Self {
        Error::Action {
            op: op.into(),
            flag,
        }
    }
}
