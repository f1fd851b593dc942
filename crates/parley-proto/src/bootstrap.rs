//! Key-exchange bootstrap types exchanged with the session broker.
//!
//! The broker stores public keys so a handshake can start while the peer is
//! offline. Only the shapes are defined here; the HTTP call itself belongs to
//! the caller.

use serde::{Deserialize, Serialize};

use crate::message::ExchangeStatus;

/// Request to open (or resume) a session with `recipient_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequest {
    /// Peer identity
    pub recipient_id: String,
    /// Our ephemeral public key, standard base64
    pub public_key: String,
}

/// Broker answer to a [`BootstrapRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapResponse {
    /// Session id assigned by the broker
    pub session_id: String,
    /// Peer's public key, present once the peer has published one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_public_key: Option<String>,
    /// `ready` when `recipient_public_key` is present
    pub status: ExchangeStatus,
}

impl BootstrapResponse {
    /// Peer key, if the broker already had one.
    ///
    /// A `pending` response never yields a key even if one is present.
    pub fn ready_key(&self) -> Option<&str> {
        match self.status {
            ExchangeStatus::Ready => self.recipient_public_key.as_deref(),
            ExchangeStatus::Pending => None,
        }
    }
}
