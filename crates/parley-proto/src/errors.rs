//! Protocol error types.

use thiserror::Error;

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while encoding or decoding wire frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame text was not valid JSON for the expected shape.
    #[error("JSON decoding failed: {0}")]
    JsonDecode(String),

    /// Value could not be serialized.
    #[error("JSON encoding failed: {0}")]
    JsonEncode(String),

    /// Compressed frame could not be inflated (bad base64 or gzip stream).
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Payload could not be compressed.
    #[error("compression failed: {0}")]
    Compression(String),

    /// Inflated payload exceeded the allowed size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Size observed so far
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Payload object has no string `type` field.
    #[error("payload has no type tag")]
    MissingType,

    /// Payload type is known but its fields are malformed.
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload {
        /// The `type` tag of the payload
        kind: String,
        /// What was wrong with it
        reason: String,
    },
}
