//! Typed realtime messages.
//!
//! Every frame's `data` object carries a `type` tag that selects one of the
//! [`Message`] variants. Decoding is keyed on that tag alone; tags this build
//! does not know are surfaced as [`Decoded::Unknown`] so newer peers never
//! crash older ones.
//!
//! # Invariants
//!
//! - Every variant has exactly one wire tag, listed in [`Message::KNOWN_TYPES`]
//! - Encoding a message and decoding it yields an equal value
//! - A chat message whose envelope cannot be parsed still decodes; the
//!   envelope is kept as [`ChatPayload::Unreadable`]

use parley_crypto::EncryptedEnvelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ProtocolError, Result};

/// All message types understood by this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Keepalive probe; answered with [`Message::Pong`]
    Ping,
    /// Keepalive answer
    Pong,
    /// Encrypted chat message
    #[serde(rename = "message")]
    Chat(ChatMessage),
    /// Public key offer or acknowledgement
    KeyExchange(KeyExchange),
    /// Sender has derived the session key
    EncryptionReady(EncryptionReady),
    /// Sender wants a fresh session key
    KeyRotationRequired(KeyRotationRequired),
    /// Typing indicator
    TypingStatus(TypingStatus),
    /// Presence change
    UserStatus(UserStatus),
    /// Server-reported error
    Error(ErrorPayload),
}

impl Message {
    /// Wire tags of every known variant.
    pub const KNOWN_TYPES: [&'static str; 9] = [
        "ping",
        "pong",
        "message",
        "key_exchange",
        "encryption_ready",
        "key_rotation_required",
        "typing_status",
        "user_status",
        "error",
    ];

    /// Discriminant of this message.
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Ping => MessageKind::Ping,
            Self::Pong => MessageKind::Pong,
            Self::Chat(_) => MessageKind::Chat,
            Self::KeyExchange(_) => MessageKind::KeyExchange,
            Self::EncryptionReady(_) => MessageKind::EncryptionReady,
            Self::KeyRotationRequired(_) => MessageKind::KeyRotationRequired,
            Self::TypingStatus(_) => MessageKind::TypingStatus,
            Self::UserStatus(_) => MessageKind::UserStatus,
            Self::Error(_) => MessageKind::Error,
        }
    }

    /// Wire tag of this message.
    pub const fn type_tag(&self) -> &'static str {
        self.kind().tag()
    }

    /// Serialize into the JSON object carried in a frame's `data` field.
    ///
    /// # Errors
    ///
    /// - `JsonEncode` if serialization fails
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| ProtocolError::JsonEncode(e.to_string()))
    }

    /// Decode a `data` object by its `type` tag.
    ///
    /// # Errors
    ///
    /// - `MissingType` if the object has no string `type` field
    /// - `InvalidPayload` if the tag is known but the fields do not match
    pub fn from_value(value: Value) -> Result<Decoded> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if !Self::KNOWN_TYPES.contains(&kind.as_str()) {
            return Ok(Decoded::Unknown { kind, raw: value });
        }

        serde_json::from_value(value)
            .map(Decoded::Known)
            .map_err(|e| ProtocolError::InvalidPayload { kind, reason: e.to_string() })
    }
}

/// Discriminant of [`Message`], one per wire tag.
///
/// Lets subscribers pick message types without matching on payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `ping`
    Ping,
    /// `pong`
    Pong,
    /// `message`
    Chat,
    /// `key_exchange`
    KeyExchange,
    /// `encryption_ready`
    EncryptionReady,
    /// `key_rotation_required`
    KeyRotationRequired,
    /// `typing_status`
    TypingStatus,
    /// `user_status`
    UserStatus,
    /// `error`
    Error,
}

impl MessageKind {
    /// Every kind, in the order of [`Message::KNOWN_TYPES`].
    pub const ALL: [Self; 9] = [
        Self::Ping,
        Self::Pong,
        Self::Chat,
        Self::KeyExchange,
        Self::EncryptionReady,
        Self::KeyRotationRequired,
        Self::TypingStatus,
        Self::UserStatus,
        Self::Error,
    ];

    /// Wire tag.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Chat => "message",
            Self::KeyExchange => "key_exchange",
            Self::EncryptionReady => "encryption_ready",
            Self::KeyRotationRequired => "key_rotation_required",
            Self::TypingStatus => "typing_status",
            Self::UserStatus => "user_status",
            Self::Error => "error",
        }
    }

    /// Kind for a wire tag, if this build knows it.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

/// Outcome of decoding a `data` object.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A message this build understands
    Known(Message),
    /// A well-formed object with an unrecognized `type` tag
    Unknown {
        /// The unrecognized tag
        kind: String,
        /// The untouched object
        raw: Value,
    },
}

/// Encrypted chat message between two identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Sender-chosen message id
    pub id: String,
    /// Sender identity
    pub from: String,
    /// Recipient identity
    pub to: String,
    /// Session whose key sealed the envelope
    pub session_id: String,
    /// Ciphertext
    pub envelope: ChatPayload,
}

/// Ciphertext of a chat message as it arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatPayload {
    /// A well-formed envelope
    Sealed(EncryptedEnvelope),
    /// An envelope this build cannot parse (unknown cipher, bad base64),
    /// kept as received
    Unreadable(Value),
}

impl ChatPayload {
    /// The envelope, or why it could not be read.
    ///
    /// # Errors
    ///
    /// - The parse error of an [`ChatPayload::Unreadable`] payload
    pub fn sealed(&self) -> std::result::Result<&EncryptedEnvelope, String> {
        match self {
            Self::Sealed(envelope) => Ok(envelope),
            Self::Unreadable(raw) => Err(serde_json::from_value::<EncryptedEnvelope>(raw.clone())
                .err()
                .map_or_else(|| "unreadable envelope".to_string(), |e| e.to_string())),
        }
    }
}

impl From<EncryptedEnvelope> for ChatPayload {
    fn from(envelope: EncryptedEnvelope) -> Self {
        Self::Sealed(envelope)
    }
}

/// Whether the sender of a key exchange already holds the other side's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeStatus {
    /// Both public keys are known; the receiver can derive immediately
    Ready,
    /// Offer sent, the counterpart has not answered yet
    Pending,
}

/// Public key offer for a session handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchange {
    /// Sender identity
    pub from: String,
    /// Recipient identity
    pub to: String,
    /// Session being negotiated
    pub session_id: String,
    /// Sender's ephemeral X25519 public key, standard base64
    pub public_key: String,
    /// Handshake progress as seen by the sender
    pub status: ExchangeStatus,
    /// Set when this exchange replaces an existing session key
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rotation: bool,
}

/// Notification that the sender derived the session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionReady {
    /// Sender identity
    pub from: String,
    /// Recipient identity
    pub to: String,
    /// Session now active
    pub session_id: String,
}

/// Request to replace the current session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRotationRequired {
    /// Sender identity
    pub from: String,
    /// Recipient identity
    pub to: String,
    /// Session whose key should be replaced
    pub session_id: String,
    /// Optional human-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Typing indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStatus {
    /// Sender identity
    pub from: String,
    /// Recipient identity
    pub to: String,
    /// Whether the sender is currently typing
    pub is_typing: bool,
}

/// Presence of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    /// Connected
    Online,
    /// Connected but idle
    Away,
    /// Not connected
    Offline,
}

/// Presence change of another user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    /// User whose presence changed
    pub user_id: String,
    /// New presence
    pub status: Presence,
    /// Last activity in Unix milliseconds, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<u64>,
}

/// Error reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable message
    pub message: String,
}
