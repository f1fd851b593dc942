//! Encrypted envelope: the self-describing unit of ciphertext on the wire.
//!
//! ```text
//! { "iv": b64, "content": b64, "tag": b64, "algorithm": "AES-256-GCM", "commitment": b64? }
//! ```
//!
//! The algorithm tag is the only input used to select the decryption path.
//! An envelope carrying a commitment is checked against it before any
//! decryption is attempted.

use serde::{Deserialize, Serialize};

use crate::{
    aead::{self, Algorithm},
    commitment::{compute_commitment, verify_commitment},
    error::CryptoError,
    keys::SessionKey,
};

/// Ciphertext plus everything needed to decrypt it with the session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Nonce used for this envelope (12 or 24 bytes depending on algorithm)
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    /// Ciphertext, same length as the plaintext
    #[serde(with = "b64")]
    pub content: Vec<u8>,
    /// Detached 16-byte authentication tag
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
    /// Cipher that produced the ciphertext
    pub algorithm: Algorithm,
    /// Optional key commitment
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub commitment: Option<Vec<u8>>,
}

impl EncryptedEnvelope {
    /// Whether this envelope carries a key commitment.
    pub fn has_commitment(&self) -> bool {
        self.commitment.is_some()
    }
}

/// Seal `plaintext` into an envelope with the given algorithm and nonce.
///
/// When `with_commitment` is set the envelope also carries
/// `SHA-256(label ‖ key ‖ iv)[..16]`.
///
/// # Errors
///
/// - `Encryption` if the nonce length does not match the algorithm
pub fn seal_envelope(
    plaintext: &[u8],
    key: &SessionKey,
    algorithm: Algorithm,
    nonce: &[u8],
    with_commitment: bool,
) -> Result<EncryptedEnvelope, CryptoError> {
    let (content, tag) = aead::seal(algorithm, key, nonce, plaintext)?;
    let commitment = with_commitment.then(|| compute_commitment(key, nonce).to_vec());

    Ok(EncryptedEnvelope { iv: nonce.to_vec(), content, tag: tag.to_vec(), algorithm, commitment })
}

/// Open an envelope.
///
/// # Errors
///
/// - `Authentication` if a commitment is present and does not match the key;
///   no decryption is attempted in that case
/// - `Decryption` if the tag does not authenticate or a field has the wrong
///   length
pub fn open_envelope(envelope: &EncryptedEnvelope, key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    let tampered = envelope
        .commitment
        .as_ref()
        .is_some_and(|commitment| !verify_commitment(key, &envelope.iv, commitment));
    if tampered {
        return Err(CryptoError::Authentication);
    }

    aead::open(envelope.algorithm, key, &envelope.iv, &envelope.content, &envelope.tag)
}

mod b64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)
    }
}

mod b64_opt {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    #[allow(clippy::ref_option, reason = "signature required by serde(with)")]
    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fill: u8) -> SessionKey {
        SessionKey::from_bytes([fill; 32])
    }

    #[test]
    fn sealed_envelope_opens() {
        let envelope = seal_envelope(b"hello", &key(1), Algorithm::Aes256Gcm, &[9; 12], false).unwrap();

        assert_eq!(envelope.iv.len(), 12);
        assert_eq!(envelope.tag.len(), aead::TAG_SIZE);
        assert!(!envelope.has_commitment());
        assert_eq!(open_envelope(&envelope, &key(1)).unwrap(), b"hello");
    }

    #[test]
    fn committed_envelope_opens_with_right_key() {
        let envelope =
            seal_envelope(b"hello", &key(1), Algorithm::XChaCha20Poly1305, &[9; 24], true).unwrap();

        assert_eq!(envelope.commitment.as_ref().map(Vec::len), Some(16));
        assert_eq!(open_envelope(&envelope, &key(1)).unwrap(), b"hello");
    }

    #[test]
    fn commitment_mismatch_is_authentication_error() {
        let envelope = seal_envelope(b"hello", &key(1), Algorithm::Aes256Gcm, &[9; 12], true).unwrap();

        assert_eq!(open_envelope(&envelope, &key(2)), Err(CryptoError::Authentication));
    }

    #[test]
    fn flipped_iv_on_committed_envelope_is_authentication_error() {
        let mut envelope =
            seal_envelope(b"hello", &key(1), Algorithm::Aes256Gcm, &[9; 12], true).unwrap();
        envelope.iv[0] ^= 0x01;

        assert_eq!(open_envelope(&envelope, &key(1)), Err(CryptoError::Authentication));
    }

    #[test]
    fn wrong_key_without_commitment_is_decryption_error() {
        let envelope = seal_envelope(b"hello", &key(1), Algorithm::Aes256Gcm, &[9; 12], false).unwrap();

        assert!(matches!(open_envelope(&envelope, &key(2)), Err(CryptoError::Decryption { .. })));
    }

    #[test]
    fn json_uses_padded_base64_and_omits_missing_commitment() {
        let envelope = EncryptedEnvelope {
            iv: vec![0; 12],
            content: vec![0xFF],
            tag: vec![1; 16],
            algorithm: Algorithm::Aes256Gcm,
            commitment: None,
        };

        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(
            json,
            r#"{"iv":"AAAAAAAAAAAAAAAA","content":"/w==","tag":"AQEBAQEBAQEBAQEBAQEBAQ==","algorithm":"AES-256-GCM"}"#
        );
    }

    #[test]
    fn json_roundtrip_preserves_commitment() {
        let envelope =
            seal_envelope(b"payload", &key(3), Algorithm::XChaCha20Poly1305, &[4; 24], true).unwrap();

        let json = serde_json::to_string(&envelope).unwrap();
        let decoded: EncryptedEnvelope = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(open_envelope(&decoded, &key(3)).unwrap(), b"payload");
    }

    #[test]
    fn unknown_algorithm_tag_fails_to_decode() {
        let json = r#"{"iv":"AAAA","content":"AAAA","tag":"AAAA","algorithm":"ROT13"}"#;
        assert!(serde_json::from_str::<EncryptedEnvelope>(json).is_err());
    }

    #[test]
    fn invalid_base64_fails_to_decode() {
        let json = r#"{"iv":"!!","content":"AAAA","tag":"AAAA","algorithm":"AES-256-GCM"}"#;
        assert!(serde_json::from_str::<EncryptedEnvelope>(json).is_err());
    }
}
