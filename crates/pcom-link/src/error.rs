//! Link error types.

use pcom_protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the link transport, discovery and the async driver.
///
/// The type is `Clone` so one failure can be handed to every waiter of a
/// coalesced operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    /// The retry budget ran out without an acknowledgment.
    #[error("delivery failed: no ACK for sequence {sequence} after {attempts} transmissions")]
    DeliveryFailed {
        /// Sequence number of the abandoned frame.
        sequence: u8,
        /// Number of times the frame was written.
        attempts: u32,
    },

    /// No response arrived within the caller's timeout.
    #[error("no response to message {msg_id} within {timeout_ms} ms")]
    ResponseTimeout {
        /// Message id that was waited on.
        msg_id: u16,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// Encoding or decoding failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Discovery could not complete.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// The link was closed before the operation finished.
    #[error("link closed")]
    Closed,

    /// The underlying byte stream failed.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err.to_string())
    }
}

/// Result type alias for link operations.
pub type LinkResult<T> = Result<T, LinkError>;
