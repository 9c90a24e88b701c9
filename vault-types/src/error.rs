//! Error types for keyrelay wire formats.

use thiserror::Error;

use crate::Kind;

/// Errors that can occur while encoding or decoding wire types.
#[derive(Debug, Error)]
pub enum WireError {
    /// JSON serialization or deserialization failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Hex string had the wrong length or alphabet
    #[error("invalid hex for {what}: expected {expected} bytes")]
    InvalidHex {
        /// Which value was being decoded.
        what: &'static str,
        /// Expected byte length.
        expected: usize,
    },

    /// Event kind does not match the layer being parsed
    #[error("unexpected event kind: expected {expected}, got {actual}")]
    UnexpectedKind {
        /// Kind required by the layer.
        expected: Kind,
        /// Kind found on the event.
        actual: Kind,
    },

    /// A required tag is absent
    #[error("missing tag: {0}")]
    MissingTag(&'static str),

    /// Declared event id does not match its contents
    #[error("event id does not match event contents")]
    IdMismatch,

    /// Relay protocol frame could not be understood
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}
