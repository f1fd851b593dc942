//! Persisted session records.

use parley_crypto::{Algorithm, CURVE};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Where a session's key material lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoragePath {
    /// Platform secure store.
    Secure,
    /// Ordinary storage, XOR-obfuscated with the device key.
    Obfuscated,
}

/// Lifecycle of a session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Handshake started, key not yet agreed.
    Pending,
    /// Key agreed and usable.
    Active,
    /// Older than the configured max age.
    Expired,
}

/// Caller-supplied facts about a key being stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    /// Cipher the session prefers
    pub algorithm: Algorithm,
    /// Whether envelopes in this session carry a key commitment
    pub has_commitment: bool,
}

impl Default for KeyInfo {
    fn default() -> Self {
        Self { algorithm: Algorithm::XChaCha20Poly1305, has_commitment: true }
    }
}

/// One record per session id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// Unix milliseconds when the key was first stored
    pub created: u64,
    /// Cipher the session prefers
    pub algorithm: Algorithm,
    /// Key agreement curve
    pub curve: String,
    /// Whether envelopes carry a key commitment
    pub has_commitment: bool,
    /// Lifecycle status
    pub status: SessionStatus,
    /// Where the key material lives
    pub storage: StoragePath,
}

impl SessionMetadata {
    /// Metadata for a freshly agreed key.
    pub fn active(info: KeyInfo, created: u64, storage: StoragePath) -> Self {
        Self {
            created,
            algorithm: info.algorithm,
            curve: CURVE.to_string(),
            has_commitment: info.has_commitment,
            status: SessionStatus::Active,
            storage,
        }
    }

    /// Milliseconds since creation at wall-clock `now_ms`.
    pub fn age_millis(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created)
    }
}

/// Persisted half of an in-flight handshake.
///
/// The ephemeral secret itself lives under the same secure-first policy as
/// session keys; this record only says where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecord {
    /// Peer the handshake is with
    pub peer: String,
    /// Unix milliseconds when the handshake started
    pub created: u64,
    /// Whether this handshake replaces an existing key
    pub rotation: bool,
    /// Where the ephemeral secret lives
    pub storage: StoragePath,
}

pub(crate) fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

pub(crate) fn from_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}
