//! X25519 key pairs and session key derivation using HKDF

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hkdf::Hkdf;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as DalekPublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Size of every key handled by this crate (public, secret, session).
pub const KEY_SIZE: usize = 32;

/// Curve identifier recorded in session metadata.
pub const CURVE: &str = "X25519";

/// Fixed HKDF salt for session key derivation
const SESSION_KEY_SALT: &[u8] = b"parley-session-salt-v1";

/// HKDF context info for session key derivation
const SESSION_KEY_INFO: &[u8] = b"parley session key";

/// X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Create from raw bytes.
    ///
    /// # Errors
    ///
    /// - `Derivation` if the slice is not exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::Derivation {
            reason: format!("public key must be {KEY_SIZE} bytes, got {}", bytes.len()),
        })?;
        Ok(Self(arr))
    }

    /// Decode from standard base64, as carried in `key_exchange` messages.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD.decode(encoded).map_err(|e| CryptoError::Derivation {
            reason: format!("public key is not valid base64: {e}"),
        })?;
        Self::from_slice(&bytes)
    }

    /// Encode as standard base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl From<[u8; KEY_SIZE]> for PublicKey {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// X25519 secret key. Never leaves the device; zeroized on drop.
#[derive(Clone)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    /// Create from raw bytes.
    ///
    /// # Errors
    ///
    /// - `Derivation` if the slice is not exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::Derivation {
            reason: format!("secret key must be {KEY_SIZE} bytes, got {}", bytes.len()),
        })?;
        Ok(Self(arr))
    }

    /// Raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care. Only the vault should persist these bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Public key corresponding to this secret.
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(DalekPublicKey::from(&secret).to_bytes())
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

/// Ephemeral X25519 key pair, generated once per handshake.
#[derive(Clone, Debug)]
pub struct KeyPair {
    public: PublicKey,
    secret: SecretKey,
}

impl KeyPair {
    /// Build a key pair from 32 uniformly random bytes.
    ///
    /// The bytes are clamped by X25519 scalar multiplication, so any 32-byte
    /// input yields a valid key pair. Caller MUST provide cryptographically
    /// secure random bytes in production.
    pub fn from_random_bytes(seed: [u8; KEY_SIZE]) -> Self {
        let secret = SecretKey(seed);
        let public = secret.public_key();
        Self { public, secret }
    }

    /// Rebuild a key pair from a persisted secret key.
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { public, secret }
    }

    /// Public half, safe to transmit.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Secret half.
    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

/// 32-byte symmetric session key. Immutable once derived; zeroized on drop.
#[derive(Clone)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice.
    ///
    /// # Errors
    ///
    /// - `Derivation` if the slice is not exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| CryptoError::Derivation {
            reason: format!("session key must be {KEY_SIZE} bytes, got {}", bytes.len()),
        })?;
        Ok(Self(arr))
    }

    /// Raw key bytes.
    ///
    /// # Security
    ///
    /// Avoid logging or persisting the returned bytes outside the vault.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SessionKey {}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// Derive the session key shared with a peer.
///
/// Computes the X25519 shared point from our secret and the peer's public key,
/// then runs HKDF-SHA256 with a fixed salt and context info to produce exactly
/// 32 bytes.
///
/// # Security
///
/// - Symmetric: `derive(a.secret, b.public) == derive(b.secret, a.public)`
/// - Deterministic: same inputs always produce the same key
/// - Non-contributory peer keys (low-order points producing an all-zero shared
///   secret) are rejected
///
/// # Errors
///
/// - `Derivation` if either input is not 32 bytes or the peer key is invalid
pub fn derive_session_key(secret: &[u8], peer_public: &[u8]) -> Result<SessionKey, CryptoError> {
    let secret = SecretKey::from_slice(secret)?;
    let peer = PublicKey::from_slice(peer_public)?;

    let shared = StaticSecret::from(secret.0).diffie_hellman(&DalekPublicKey::from(peer.0));
    if !shared.was_contributory() {
        return Err(CryptoError::Derivation {
            reason: "peer public key is a low-order point".to_string(),
        });
    }

    let hkdf = Hkdf::<Sha256>::new(Some(SESSION_KEY_SALT), shared.as_bytes());

    let mut key = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(SESSION_KEY_INFO, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    Ok(SessionKey(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(fill: u8) -> KeyPair {
        KeyPair::from_random_bytes([fill; KEY_SIZE])
    }

    #[test]
    fn derivation_is_symmetric() {
        let alice = pair(0x11);
        let bob = pair(0x22);

        let ab = derive_session_key(alice.secret().as_bytes(), bob.public().as_bytes()).unwrap();
        let ba = derive_session_key(bob.secret().as_bytes(), alice.public().as_bytes()).unwrap();

        assert_eq!(ab, ba);
    }

    #[test]
    fn derivation_is_deterministic() {
        let alice = pair(0x11);
        let bob = pair(0x22);

        let k1 = derive_session_key(alice.secret().as_bytes(), bob.public().as_bytes()).unwrap();
        let k2 = derive_session_key(alice.secret().as_bytes(), bob.public().as_bytes()).unwrap();

        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn different_peers_produce_different_keys() {
        let alice = pair(0x11);
        let bob = pair(0x22);
        let carol = pair(0x33);

        let ab = derive_session_key(alice.secret().as_bytes(), bob.public().as_bytes()).unwrap();
        let ac = derive_session_key(alice.secret().as_bytes(), carol.public().as_bytes()).unwrap();

        assert_ne!(ab, ac);
    }

    #[test]
    fn rejects_short_secret() {
        let bob = pair(0x22);
        let result = derive_session_key(&[0u8; 31], bob.public().as_bytes());
        assert!(matches!(result, Err(CryptoError::Derivation { .. })));
    }

    #[test]
    fn rejects_long_peer_key() {
        let alice = pair(0x11);
        let result = derive_session_key(alice.secret().as_bytes(), &[7u8; 33]);
        assert!(matches!(result, Err(CryptoError::Derivation { .. })));
    }

    #[test]
    fn rejects_low_order_peer_key() {
        // The identity point yields an all-zero shared secret
        let alice = pair(0x11);
        let result = derive_session_key(alice.secret().as_bytes(), &[0u8; KEY_SIZE]);
        assert!(matches!(result, Err(CryptoError::Derivation { .. })));
    }

    #[test]
    fn public_key_base64_roundtrip() {
        let alice = pair(0x42);
        let encoded = alice.public().to_base64();
        let decoded = PublicKey::from_base64(&encoded).unwrap();
        assert_eq!(&decoded, alice.public());
    }

    #[test]
    fn public_key_rejects_bad_base64() {
        assert!(PublicKey::from_base64("not base64!").is_err());
        assert!(PublicKey::from_base64("AAAA").is_err());
    }

    #[test]
    fn key_pair_from_secret_matches_original() {
        let original = pair(0x5A);
        let restored = KeyPair::from_secret(original.secret().clone());
        assert_eq!(restored.public(), original.public());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let alice = pair(0x11);
        let secret_debug = format!("{:?}", alice.secret());
        let session_debug = format!("{:?}", SessionKey::from_bytes([9; KEY_SIZE]));

        assert_eq!(secret_debug, "SecretKey([REDACTED])");
        assert_eq!(session_debug, "SessionKey([REDACTED])");
    }

    #[test]
    fn session_key_rejects_wrong_length() {
        assert!(SessionKey::from_slice(&[0u8; 16]).is_err());
        assert!(SessionKey::from_slice(&[0u8; KEY_SIZE]).is_ok());
    }
}
