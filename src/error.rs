//! Error types for wirepeer.

use thiserror::Error;

/// Main error type for all wirepeer operations.
#[derive(Debug, Error)]
pub enum WireError {
    /// I/O error during socket/pipe/serial operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure while encoding a value into the wire format.
    #[error("encode error: {0}")]
    Encode(String),

    /// Failure while decoding wire bytes into a value.
    #[error("decode error: {0}")]
    Decode(String),

    /// Protocol error (invalid header, bad handshake, oversized frame).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation attempted on a connector that is not connected.
    #[error("not connected")]
    NotConnected,

    /// A synchronous call got no response within the allowed time.
    #[error("call timed out for message id {0}")]
    Timeout(i32),

    /// The remote side reported an application error for this call.
    #[error("remote error: {0}")]
    Remote(String),

    /// No bound method for the given message id.
    #[error("no bound method for message id {0}")]
    HandlerNotFound(i32),
}

/// Result type alias using WireError.
pub type Result<T> = std::result::Result<T, WireError>;
