//! Coordinator states, events and actions.

use parley_proto::Message;

/// Handshake state for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No key and no handshake.
    NoSession,
    /// Our offer is out; nothing heard back yet.
    KeyExchangeInitiated,
    /// The broker queued our offer for an offline peer.
    AwaitingPeer,
    /// Key agreed; messages can flow.
    Active,
    /// Key agreed and a replacement handshake is in flight. The current key
    /// keeps working until the replacement lands.
    Rotating,
}

impl SessionState {
    /// Whether a handshake is in flight.
    pub fn is_handshaking(self) -> bool {
        matches!(self, Self::KeyExchangeInitiated | Self::AwaitingPeer | Self::Rotating)
    }

    /// Whether messages can be encrypted in this state.
    pub fn has_key(self) -> bool {
        matches!(self, Self::Active | Self::Rotating)
    }
}

/// Body of a received chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Decrypted plaintext.
    Plaintext(Vec<u8>),
    /// The message could not be decrypted. The session is kept; only this
    /// message is lost.
    Undecryptable {
        /// Why decryption failed
        reason: String,
    },
}

/// A chat message after decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    /// Message id assigned by the sender
    pub id: String,
    /// Sender identity
    pub from: String,
    /// Session the message belongs to
    pub session_id: String,
    /// Plaintext, or a placeholder
    pub body: MessageBody,
}

/// Events the coordinator surfaces to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session key was agreed (initially or by rotation).
    EncryptionReady {
        /// Peer identity
        peer: String,
        /// Session id
        session_id: String,
        /// Safety fingerprint of the peer's ephemeral public key
        fingerprint: String,
        /// Safety fingerprint of our own ephemeral public key, which the
        /// peer sees as its `fingerprint`
        local_fingerprint: String,
    },
    /// The peer reported that it derived the key too.
    PeerConfirmed {
        /// Peer identity
        peer: String,
    },
    /// A key rotation started.
    RotationStarted {
        /// Peer identity
        peer: String,
    },
    /// A handshake got no answer in time and was abandoned.
    HandshakeTimedOut {
        /// Peer identity
        peer: String,
        /// State the session fell back to
        fallback: SessionState,
    },
    /// A session was torn down and its keys deleted.
    SessionClosed {
        /// Peer identity
        peer: String,
    },
    /// A chat message arrived.
    MessageReceived(DecryptedMessage),
}

/// Actions the coordinator produces for the caller to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorAction {
    /// Send this message through the transport.
    Send(Message),
    /// Deliver this event to the application.
    Emit(SessionEvent),
}
