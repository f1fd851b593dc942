//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors produced by the cryptographic primitives.
///
/// Variants map one-to-one onto the failure classes callers must distinguish:
/// a commitment mismatch ([`CryptoError::Authentication`]) signals possible
/// key substitution, while [`CryptoError::Decryption`] covers corrupted
/// ciphertext or a wrong key without commitment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The secure random source was unavailable.
    #[error("key generation failed: {reason}")]
    KeyGeneration {
        /// Why key generation failed
        reason: String,
    },

    /// Shared-secret derivation failed (bad key length or invalid peer key).
    #[error("key derivation failed: {reason}")]
    Derivation {
        /// Why derivation failed
        reason: String,
    },

    /// Every available cipher failed to encrypt.
    #[error("encryption failed: {reason}")]
    Encryption {
        /// Why encryption failed
        reason: String,
    },

    /// Key commitment did not match: the envelope was sealed with a different
    /// key (or its nonce was altered).
    #[error("key commitment mismatch: possible tampering")]
    Authentication,

    /// Ciphertext failed authentication or could not be decoded.
    #[error("decryption failed: {reason}")]
    Decryption {
        /// Why decryption failed
        reason: String,
    },
}

impl CryptoError {
    /// Returns true if this error indicates tampering or a wrong key rather
    /// than a local failure.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Authentication | Self::Decryption { .. })
    }
}
