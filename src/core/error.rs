//! Failure kinds for the transfer pipelines.
//!
//! The send and receive paths report errors by kind instead of throwing
//! strings around: the session maps each kind to a presenter surface and
//! decides whether the sender-side recovery path applies. Every error is
//! terminal for the transfer it belongs to, never for the session.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Malformed input before any bytes moved: bad room id, oversized
    /// frame, metadata that does not parse.
    #[error("validation: {0}")]
    Validation(String),

    /// ICE/SDP negotiation failed: no local candidates, no working pair.
    #[error("negotiation: {0}")]
    Negotiation(String),

    /// The data channel never opened, closed mid-transfer, or errored.
    #[error("transport: {0}")]
    Transport(String),

    /// A chunk's leading CRC32 disagrees with its payload.
    #[error("integrity: expected crc32 {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// Reading the source file or writing the streaming sink failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn transport(msg: impl Into<String>) -> Self {
        TransferError::Transport(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        TransferError::Validation(msg.into())
    }

    pub fn negotiation(msg: impl Into<String>) -> Self {
        TransferError::Negotiation(msg.into())
    }
}
