//! Key commitment for encrypted envelopes.
//!
//! AEAD tags authenticate the ciphertext under *some* key, but a malicious
//! sender can craft ciphertexts that authenticate under more than one key. The
//! commitment binds the envelope to one specific key: a recipient recomputes it
//! from the key it believes is in use and rejects the envelope on mismatch,
//! before trusting any decrypted content.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::keys::SessionKey;

/// Commitment length in bytes (truncated SHA-256)
pub const COMMITMENT_SIZE: usize = 16;

/// Domain separation label for commitments
const COMMITMENT_LABEL: &[u8] = b"parley-key-commitment-v1";

/// Compute `SHA-256(label ‖ key ‖ iv)` truncated to 16 bytes.
pub fn compute_commitment(key: &SessionKey, iv: &[u8]) -> [u8; COMMITMENT_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(COMMITMENT_LABEL);
    hasher.update(key.as_bytes());
    hasher.update(iv);
    let digest = hasher.finalize();

    let mut commitment = [0u8; COMMITMENT_SIZE];
    commitment.copy_from_slice(&digest[..COMMITMENT_SIZE]);
    commitment
}

/// Check a received commitment in constant time.
///
/// Returns false for commitments of the wrong length.
pub fn verify_commitment(key: &SessionKey, iv: &[u8], commitment: &[u8]) -> bool {
    if commitment.len() != COMMITMENT_SIZE {
        return false;
    }
    compute_commitment(key, iv).ct_eq(commitment).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commitment_verifies_for_same_inputs() {
        let key = SessionKey::from_bytes([7; 32]);
        let iv = [1u8; 12];

        let commitment = compute_commitment(&key, &iv);
        assert!(verify_commitment(&key, &iv, &commitment));
    }

    #[test]
    fn commitment_binds_the_key() {
        let iv = [1u8; 12];
        let commitment = compute_commitment(&SessionKey::from_bytes([7; 32]), &iv);

        assert!(!verify_commitment(&SessionKey::from_bytes([8; 32]), &iv, &commitment));
    }

    #[test]
    fn commitment_binds_the_iv() {
        let key = SessionKey::from_bytes([7; 32]);
        let commitment = compute_commitment(&key, &[1u8; 12]);

        let mut flipped = [1u8; 12];
        flipped[11] ^= 0x80;
        assert!(!verify_commitment(&key, &flipped, &commitment));
    }

    #[test]
    fn truncated_commitment_is_rejected() {
        let key = SessionKey::from_bytes([7; 32]);
        let iv = [1u8; 24];
        let commitment = compute_commitment(&key, &iv);

        assert!(!verify_commitment(&key, &iv, &commitment[..8]));
        assert!(!verify_commitment(&key, &iv, &[]));
    }
}
