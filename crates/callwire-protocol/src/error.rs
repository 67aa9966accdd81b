//! Error types for the protocol layer.
//!
//! Every one of these describes a payload that must not reach application
//! listeners. Transports log them and drop the message.

/// Errors that can occur while encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// The payload is not a well-formed envelope (bad JSON, unknown
    /// `kind`, missing or mistyped fields).
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The payload was empty.
    #[error("empty payload")]
    Empty,

    /// The envelope deserialized but breaks a protocol rule, e.g. a request
    /// without a method or a failed response without an error code.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
