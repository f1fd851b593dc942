//! Human-comparable public key fingerprints.
//!
//! Two users read their fingerprints to each other (or compare them on
//! screen) to confirm no one substituted a key during the exchange. The full
//! SHA-256 digest is truncated to 72 bits and mapped onto a 64-symbol emoji
//! alphabet, 6 bits per symbol.

use sha2::{Digest, Sha256};

use crate::keys::PublicKey;

/// Number of symbols in a fingerprint.
pub const FINGERPRINT_SYMBOLS: usize = 12;

/// Bits carried by each symbol.
const BITS_PER_SYMBOL: usize = 6;

/// Display alphabet (64 entries, one per 6-bit value)
const ALPHABET: [&str; 64] = [
    "🐶", "🐱", "🐭", "🐹", "🐰", "🦊", "🐻", "🐼",
    "🐨", "🐯", "🦁", "🐮", "🐷", "🐸", "🐵", "🐔",
    "🐧", "🐦", "🐤", "🦆", "🦅", "🦉", "🦇", "🐺",
    "🐗", "🐴", "🦄", "🐝", "🐛", "🦋", "🐌", "🐞",
    "🐜", "🦂", "🐢", "🐍", "🦎", "🐙", "🦑", "🦐",
    "🦀", "🐡", "🐠", "🐟", "🐬", "🐳", "🐋", "🦈",
    "🐊", "🐅", "🐆", "🦓", "🦍", "🐘", "🦏", "🐪",
    "🐫", "🦒", "🐃", "🐂", "🐄", "🐎", "🐖", "🐏",
];

/// Fingerprint of a public key: 12 space-separated symbols.
///
/// Deterministic; 72 bits of the digest make accidental collisions
/// negligible.
pub fn fingerprint(public_key: &PublicKey) -> String {
    symbol_indices(public_key)
        .iter()
        .map(|&index| ALPHABET[index])
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split the first 72 digest bits into 6-bit alphabet indices.
fn symbol_indices(public_key: &PublicKey) -> [usize; FINGERPRINT_SYMBOLS] {
    let digest = Sha256::digest(public_key.as_bytes());

    // 72 bits = 9 bytes
    let mut acc: u128 = 0;
    for byte in &digest[..9] {
        acc = (acc << 8) | u128::from(*byte);
    }

    let mut indices = [0usize; FINGERPRINT_SYMBOLS];
    for (i, slot) in indices.iter_mut().enumerate() {
        let shift = (FINGERPRINT_SYMBOLS - 1 - i) * BITS_PER_SYMBOL;
        *slot = ((acc >> shift) & 0x3F) as usize;
    }
    indices
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::keys::KeyPair;

    #[test]
    fn fingerprint_is_deterministic() {
        let key = *KeyPair::from_random_bytes([3; 32]).public();
        assert_eq!(fingerprint(&key), fingerprint(&key));
    }

    #[test]
    fn fingerprint_has_expected_symbol_count() {
        let key = *KeyPair::from_random_bytes([3; 32]).public();
        assert_eq!(fingerprint(&key).split(' ').count(), FINGERPRINT_SYMBOLS);
    }

    #[test]
    fn different_keys_have_different_fingerprints() {
        let a = *KeyPair::from_random_bytes([3; 32]).public();
        let b = *KeyPair::from_random_bytes([4; 32]).public();
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn alphabet_symbols_are_distinct() {
        let unique: HashSet<_> = ALPHABET.iter().collect();
        assert_eq!(unique.len(), ALPHABET.len());
    }

    #[test]
    fn indices_follow_digest_bits() {
        let key = PublicKey::from([0u8; 32]);
        let digest = Sha256::digest(key.as_bytes());
        let indices = symbol_indices(&key);

        // First symbol is the top 6 bits of the first digest byte
        assert_eq!(indices[0], usize::from(digest[0] >> 2));
        // Last symbol is the low 6 bits of the ninth digest byte
        assert_eq!(indices[FINGERPRINT_SYMBOLS - 1], usize::from(digest[8] & 0x3F));
    }
}
