//! Wire frame: the JSON text sent over the realtime socket.
//!
//! ```text
//! { "compressed": false, "timestamp": 1700000000000, "data": { "type": "ping" } }
//! { "compressed": true,  "timestamp": 1700000000000, "data": "<base64(gzip(json))>" }
//! ```
//!
//! A compressed frame that cannot be inflated is an error, never a plaintext
//! fallback: the receiver logs it and skips the frame.

use std::io::{Read, Write};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    errors::{ProtocolError, Result},
    message::{Decoded, Message},
};

/// Upper bound on an inflated payload (1 MiB)
pub const MAX_INFLATED_SIZE: usize = 1024 * 1024;

/// One realtime frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    /// Whether `data` is a base64 gzip string instead of an object
    #[serde(default)]
    pub compressed: bool,
    /// Sender clock, Unix milliseconds
    #[serde(default)]
    pub timestamp: u64,
    /// Message object, or its compressed form
    pub data: Value,
}

impl WireEnvelope {
    /// Uncompressed frame carrying `message`.
    ///
    /// # Errors
    ///
    /// - `JsonEncode` if the message cannot be serialized
    pub fn new(message: &Message, timestamp: u64) -> Result<Self> {
        Ok(Self { compressed: false, timestamp, data: message.to_value()? })
    }

    /// Compressed frame carrying `message`.
    ///
    /// # Errors
    ///
    /// - `JsonEncode` if the message cannot be serialized
    /// - `Compression` if gzip fails
    pub fn compressed(message: &Message, timestamp: u64) -> Result<Self> {
        let json = serde_json::to_vec(message).map_err(|e| ProtocolError::JsonEncode(e.to_string()))?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json).map_err(|e| ProtocolError::Compression(e.to_string()))?;
        let gz = encoder.finish().map_err(|e| ProtocolError::Compression(e.to_string()))?;

        Ok(Self { compressed: true, timestamp, data: Value::String(STANDARD.encode(gz)) })
    }

    /// Parse frame text.
    ///
    /// # Errors
    ///
    /// - `JsonDecode` if the text is not a frame object
    pub fn from_text(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ProtocolError::JsonDecode(e.to_string()))
    }

    /// Serialize to frame text.
    ///
    /// # Errors
    ///
    /// - `JsonEncode` if serialization fails
    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::JsonEncode(e.to_string()))
    }

    /// Decode the carried message, inflating it first if compressed.
    ///
    /// # Errors
    ///
    /// - `Decompression` if a compressed payload is not base64 gzip of JSON
    /// - `PayloadTooLarge` if the inflated payload exceeds [`MAX_INFLATED_SIZE`]
    /// - `MissingType` / `InvalidPayload` from message decoding
    pub fn decode_message(&self) -> Result<Decoded> {
        if !self.compressed {
            return Message::from_value(self.data.clone());
        }

        let Value::String(encoded) = &self.data else {
            return Err(ProtocolError::Decompression(
                "compressed frame data is not a string".to_string(),
            ));
        };

        let inflated = inflate(encoded)?;
        let value: Value = serde_json::from_slice(&inflated)
            .map_err(|e| ProtocolError::Decompression(format!("inflated data is not JSON: {e}")))?;
        Message::from_value(value)
    }
}

/// Parse frame text and decode its message in one step.
///
/// # Errors
///
/// See [`WireEnvelope::from_text`] and [`WireEnvelope::decode_message`].
pub fn decode_frame(text: &str) -> Result<(WireEnvelope, Decoded)> {
    let frame = WireEnvelope::from_text(text)?;
    let decoded = frame.decode_message()?;
    Ok((frame, decoded))
}

fn inflate(encoded: &str) -> Result<Vec<u8>> {
    let gz = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| ProtocolError::Decompression(format!("invalid base64: {e}")))?;

    // Read one byte past the limit so oversized payloads are detected
    let mut inflated = Vec::new();
    GzDecoder::new(gz.as_slice())
        .take(MAX_INFLATED_SIZE as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| ProtocolError::Decompression(format!("invalid gzip stream: {e}")))?;

    if inflated.len() > MAX_INFLATED_SIZE {
        return Err(ProtocolError::PayloadTooLarge { size: inflated.len(), max: MAX_INFLATED_SIZE });
    }
    Ok(inflated)
}
