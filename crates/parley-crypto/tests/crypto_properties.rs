//! Property-based tests for key agreement and envelope sealing
//!
//! Checks the properties two devices rely on: both sides derive the same key,
//! every sealed envelope opens with that key, and any alteration of a committed
//! envelope is caught before plaintext is produced.

use parley_crypto::{
    Algorithm, CryptoError, KeyPair, SessionKey, derive_session_key, fingerprint, open_envelope,
    seal_envelope,
};
use proptest::prelude::*;

fn arbitrary_algorithm() -> impl Strategy<Value = Algorithm> {
    prop_oneof![Just(Algorithm::Aes256Gcm), Just(Algorithm::XChaCha20Poly1305)]
}

/// Algorithm paired with a nonce of the right length
fn algorithm_and_nonce() -> impl Strategy<Value = (Algorithm, Vec<u8>)> {
    arbitrary_algorithm().prop_flat_map(|algorithm| {
        (Just(algorithm), prop::collection::vec(any::<u8>(), algorithm.nonce_len()))
    })
}

#[test]
fn prop_derivation_is_symmetric() {
    proptest!(|(seed_a in any::<[u8; 32]>(), seed_b in any::<[u8; 32]>())| {
        let alice = KeyPair::from_random_bytes(seed_a);
        let bob = KeyPair::from_random_bytes(seed_b);

        let ab = derive_session_key(alice.secret().as_bytes(), bob.public().as_bytes());
        let ba = derive_session_key(bob.secret().as_bytes(), alice.public().as_bytes());

        // Random seeds essentially never produce low-order public keys, but
        // both sides must agree either way
        match (ab, ba) {
            (Ok(ab), Ok(ba)) => prop_assert_eq!(ab.as_bytes(), ba.as_bytes()),
            (Err(_), Err(_)) => {},
            _ => prop_assert!(false, "only one side derived a key"),
        }
    });
}

#[test]
fn prop_envelope_roundtrip() {
    proptest!(|(
        key in any::<[u8; 32]>(),
        (algorithm, nonce) in algorithm_and_nonce(),
        plaintext in prop::collection::vec(any::<u8>(), 0..2048),
        with_commitment in any::<bool>(),
    )| {
        let key = SessionKey::from_bytes(key);

        let envelope = seal_envelope(&plaintext, &key, algorithm, &nonce, with_commitment)
            .expect("seal with correct nonce length");

        prop_assert_eq!(envelope.algorithm, algorithm);
        prop_assert_eq!(envelope.content.len(), plaintext.len());
        prop_assert_eq!(envelope.has_commitment(), with_commitment);

        let opened = open_envelope(&envelope, &key).expect("open with same key");
        prop_assert_eq!(opened, plaintext);
    });
}

#[test]
fn prop_committed_envelope_rejects_iv_bit_flip() {
    proptest!(|(
        key in any::<[u8; 32]>(),
        (algorithm, nonce) in algorithm_and_nonce(),
        plaintext in prop::collection::vec(any::<u8>(), 1..256),
        bit in 0usize..192,
    )| {
        let key = SessionKey::from_bytes(key);
        let mut envelope = seal_envelope(&plaintext, &key, algorithm, &nonce, true)
            .expect("seal with correct nonce length");

        let bit = bit % (envelope.iv.len() * 8);
        envelope.iv[bit / 8] ^= 1 << (bit % 8);

        prop_assert_eq!(open_envelope(&envelope, &key), Err(CryptoError::Authentication));
    });
}

#[test]
fn prop_committed_envelope_rejects_wrong_key() {
    proptest!(|(
        key in any::<[u8; 32]>(),
        other in any::<[u8; 32]>(),
        (algorithm, nonce) in algorithm_and_nonce(),
    )| {
        prop_assume!(key != other);

        let envelope = seal_envelope(b"hello", &SessionKey::from_bytes(key), algorithm, &nonce, true)
            .expect("seal with correct nonce length");

        prop_assert_eq!(
            open_envelope(&envelope, &SessionKey::from_bytes(other)),
            Err(CryptoError::Authentication)
        );
    });
}

#[test]
fn prop_ciphertext_tamper_never_yields_plaintext() {
    proptest!(|(
        key in any::<[u8; 32]>(),
        (algorithm, nonce) in algorithm_and_nonce(),
        plaintext in prop::collection::vec(any::<u8>(), 1..256),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    )| {
        let key = SessionKey::from_bytes(key);
        let mut envelope = seal_envelope(&plaintext, &key, algorithm, &nonce, false)
            .expect("seal with correct nonce length");

        let i = index.index(envelope.content.len());
        envelope.content[i] ^= flip;

        let result = open_envelope(&envelope, &key);
        let is_decryption_error = matches!(result, Err(CryptoError::Decryption { .. }));
        prop_assert!(is_decryption_error);
    });
}

#[test]
fn prop_fingerprint_is_stable_per_key() {
    proptest!(|(seed in any::<[u8; 32]>())| {
        let pair = KeyPair::from_random_bytes(seed);
        let first = fingerprint(pair.public());

        prop_assert_eq!(first.clone(), fingerprint(pair.public()));
        prop_assert_eq!(first.split(' ').count(), 12);
    });
}

#[test]
fn handshake_hello_roundtrip() {
    let alice = KeyPair::from_random_bytes([0xA1; 32]);
    let bob = KeyPair::from_random_bytes([0xB0; 32]);

    let alice_key = derive_session_key(alice.secret().as_bytes(), bob.public().as_bytes()).unwrap();
    let bob_key = derive_session_key(bob.secret().as_bytes(), alice.public().as_bytes()).unwrap();

    let envelope = seal_envelope(b"hello", &alice_key, Algorithm::Aes256Gcm, &[7; 12], true).unwrap();
    assert_eq!(open_envelope(&envelope, &bob_key).unwrap(), b"hello");

    assert_eq!(hex::encode(alice_key.as_bytes()), hex::encode(bob_key.as_bytes()));
}
