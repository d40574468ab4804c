//! Transport error types.

use thiserror::Error;

/// Errors raised by a transport while connecting, reading or writing frames.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to establish a connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The channel is closed and can no longer carry frames.
    #[error("connection closed")]
    ConnectionClosed,

    /// The address could not be understood by the transport.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A frame exceeded the configured size limit.
    #[error("message of {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}
