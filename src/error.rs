//! Error types for k2-client.

use std::time::Duration;

use thiserror::Error;

use crate::message::NakCode;
use crate::protocol::FrameError;

/// Main error type for all K2 session operations.
#[derive(Debug, Error)]
pub enum K2Error {
    /// Frame failed a structural parse (delimiters, addressing, 8-bit data).
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Frame or payload failed its integrity check.
    #[error(
        "Checksum mismatch in {}: expected 0x{expected:02X}, got 0x{actual:02X}",
        command_label(.command)
    )]
    ChecksumMismatch {
        /// Command byte of the damaged frame.
        command: u8,
        /// Checksum computed over the received bytes.
        expected: u8,
        /// Checksum carried by the received bytes.
        actual: u8,
    },

    /// More bytes are needed before the frame can be decoded.
    #[error("Truncated frame")]
    Truncated,

    /// No matching reply arrived within the bound.
    #[error("No reply from device within {0:?}")]
    Timeout(Duration),

    /// The transport closed, or the session was closed, mid-operation.
    #[error("Disconnected")]
    Disconnected,

    /// Caller supplied an out-of-range argument; nothing was sent.
    #[error("Invalid argument: {0}")]
    Validation(String),

    /// Chunked reassembly was aborted.
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// The device answered a LOAD or WRITE with a negative acknowledgement.
    #[error("Device rejected request: {code:?}")]
    Rejected {
        /// Reason reported by the device.
        code: NakCode,
    },

    /// A reply of the wrong shape resolved the request.
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    /// I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config and catalog snapshots).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// The outbound queue stayed full past the backpressure timeout.
    #[error("Writer queue full")]
    Backpressure,

    /// The MIDI port could not be opened or written.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<FrameError> for K2Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Malformed(reason) => K2Error::Malformed(reason),
            FrameError::ChecksumMismatch {
                command,
                expected,
                actual,
                ..
            } => K2Error::ChecksumMismatch {
                command,
                expected,
                actual,
            },
            FrameError::Truncated => K2Error::Truncated,
        }
    }
}

fn command_label(command: &u8) -> &'static str {
    crate::message::command_name(*command)
}

/// Result type alias using K2Error.
pub type Result<T> = std::result::Result<T, K2Error>;
