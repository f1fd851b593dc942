//! Parley wire protocol.
//!
//! Realtime traffic is JSON text frames over a websocket. Each frame wraps one
//! tagged message:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ WireEnvelope { compressed, timestamp, data } │
//! └──────────────────────┬───────────────────────┘
//!                        │ data (object, or base64 gzip string)
//!                        ▼
//!            Message { "type": "...", ... }
//! ```
//!
//! Chat payloads carry an [`parley_crypto::EncryptedEnvelope`]; the server
//! only ever sees ciphertext and public keys. An envelope this build cannot
//! parse does not sink the frame, so the receiver can still account for the
//! message.

pub mod bootstrap;
pub mod errors;
pub mod frame;
pub mod message;

pub use bootstrap::{BootstrapRequest, BootstrapResponse};
pub use errors::{ProtocolError, Result};
pub use frame::{MAX_INFLATED_SIZE, WireEnvelope, decode_frame};
pub use message::{
    ChatMessage, ChatPayload, Decoded, EncryptionReady, ErrorPayload, ExchangeStatus, KeyExchange,
    KeyRotationRequired, Message, MessageKind, Presence, TypingStatus, UserStatus,
};
