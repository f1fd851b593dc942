//! Authenticated encryption with AES-256-GCM and `XChaCha20-Poly1305`
//!
//! All functions are pure - nonces must be provided by the caller.
//! Tags are kept detached from the ciphertext so the envelope can carry them
//! as a separate field.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{AeadInPlace, KeyInit},
};
use serde::{Deserialize, Serialize};

use crate::{error::CryptoError, keys::SessionKey};

/// Authentication tag size shared by both ciphers (16 bytes)
pub const TAG_SIZE: usize = 16;

/// AEAD algorithm that produced an envelope.
///
/// The serialized tag travels with every envelope and is the only input used
/// to choose the decryption path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// AES-256-GCM, 96-bit nonce. Preferred when the CPU accelerates AES.
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    /// `XChaCha20-Poly1305`, 192-bit nonce. Constant-time in software.
    #[serde(rename = "XChaCha20-Poly1305")]
    XChaCha20Poly1305,
}

impl Algorithm {
    /// Nonce length in bytes.
    pub const fn nonce_len(self) -> usize {
        match self {
            Self::Aes256Gcm => 12,
            Self::XChaCha20Poly1305 => 24,
        }
    }

    /// Wire tag for this algorithm.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "AES-256-GCM",
            Self::XChaCha20Poly1305 => "XChaCha20-Poly1305",
        }
    }

    /// Parse a wire tag. `None` for unknown algorithms.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "AES-256-GCM" => Some(Self::Aes256Gcm),
            "XChaCha20-Poly1305" => Some(Self::XChaCha20Poly1305),
            _ => None,
        }
    }

    /// The software fallback for this algorithm, if any.
    pub const fn fallback(self) -> Option<Self> {
        match self {
            Self::Aes256Gcm => Some(Self::XChaCha20Poly1305),
            Self::XChaCha20Poly1305 => None,
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encrypt `plaintext` under `key` with the given algorithm and nonce.
///
/// Returns the ciphertext (same length as the plaintext) and the detached
/// 16-byte tag.
///
/// # Security
///
/// - Caller MUST never reuse a nonce with the same key
/// - Caller MUST provide cryptographically secure random nonces in production
///
/// # Errors
///
/// - `Encryption` if the nonce length does not match the algorithm or the
///   cipher rejects the input
pub fn seal(
    algorithm: Algorithm,
    key: &SessionKey,
    nonce: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_SIZE]), CryptoError> {
    check_nonce(algorithm, nonce).map_err(|reason| CryptoError::Encryption { reason })?;

    let mut buffer = plaintext.to_vec();
    let tag = match algorithm {
        Algorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new(key.as_bytes().into());
            cipher
                .encrypt_in_place_detached(aes_gcm::Nonce::from_slice(nonce), b"", &mut buffer)
                .map_err(|_| CryptoError::Encryption {
                    reason: format!("{algorithm} rejected the plaintext"),
                })?
        },
        Algorithm::XChaCha20Poly1305 => {
            let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
            cipher
                .encrypt_in_place_detached(
                    chacha20poly1305::XNonce::from_slice(nonce),
                    b"",
                    &mut buffer,
                )
                .map_err(|_| CryptoError::Encryption {
                    reason: format!("{algorithm} rejected the plaintext"),
                })?
        },
    };

    let mut detached = [0u8; TAG_SIZE];
    detached.copy_from_slice(tag.as_slice());
    Ok((buffer, detached))
}

/// Decrypt `ciphertext` and verify its detached tag.
///
/// # Errors
///
/// - `Decryption` if the nonce or tag length is wrong, or the tag does not
///   authenticate (tampering or wrong key)
pub fn open(
    algorithm: Algorithm,
    key: &SessionKey,
    nonce: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    check_nonce(algorithm, nonce).map_err(|reason| CryptoError::Decryption { reason })?;
    if tag.len() != TAG_SIZE {
        return Err(CryptoError::Decryption {
            reason: format!("tag must be {TAG_SIZE} bytes, got {}", tag.len()),
        });
    }

    let mut buffer = ciphertext.to_vec();
    let result = match algorithm {
        Algorithm::Aes256Gcm => Aes256Gcm::new(key.as_bytes().into()).decrypt_in_place_detached(
            aes_gcm::Nonce::from_slice(nonce),
            b"",
            &mut buffer,
            aes_gcm::Tag::from_slice(tag),
        ),
        Algorithm::XChaCha20Poly1305 => XChaCha20Poly1305::new(key.as_bytes().into())
            .decrypt_in_place_detached(
                chacha20poly1305::XNonce::from_slice(nonce),
                b"",
                &mut buffer,
                chacha20poly1305::Tag::from_slice(tag),
            ),
    };

    result.map_err(|_| CryptoError::Decryption { reason: "authentication failed".to_string() })?;
    Ok(buffer)
}

fn check_nonce(algorithm: Algorithm, nonce: &[u8]) -> Result<(), String> {
    if nonce.len() == algorithm.nonce_len() {
        Ok(())
    } else {
        Err(format!(
            "{algorithm} requires a {}-byte nonce, got {}",
            algorithm.nonce_len(),
            nonce.len()
        ))
    }
}
