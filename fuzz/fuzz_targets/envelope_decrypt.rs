//! Fuzz target for envelope decryption
//!
//! # Strategy
//!
//! - Raw JSON: arbitrary bytes parsed as an envelope, then opened
//! - Mutations: a freshly sealed envelope with one field corrupted
//!
//! # Invariants
//!
//! - Opening NEVER panics, whatever the field lengths
//! - An unmodified envelope opens to the original plaintext
//! - Any corrupted byte in iv, content or tag, or the wrong key, is rejected
//! - Dropping the commitment still opens (commitment is additive)

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use parley_crypto::{Algorithm, EncryptedEnvelope, SessionKey, open_envelope, seal_envelope};

#[derive(Debug, Clone, Arbitrary)]
enum Input {
    RawJson(Vec<u8>),
    Sealed {
        key: [u8; 32],
        nonce: [u8; 24],
        plaintext: Vec<u8>,
        xchacha: bool,
        with_commitment: bool,
        mutation: Mutation,
    },
}

#[derive(Debug, Clone, Arbitrary)]
enum Mutation {
    None,
    FlipIv { index: u8, bit: u8 },
    FlipContent { index: u16, bit: u8 },
    FlipTag { index: u8, bit: u8 },
    TruncateTag,
    WrongKey { index: u8, bit: u8 },
    SwapAlgorithm,
    DropCommitment,
}

fuzz_target!(|input: Input| {
    match input {
        Input::RawJson(bytes) => {
            if let Ok(envelope) = serde_json::from_slice::<EncryptedEnvelope>(&bytes) {
                let _ = open_envelope(&envelope, &SessionKey::from_bytes([0; 32]));
            }
        },
        Input::Sealed { key, nonce, plaintext, xchacha, with_commitment, mutation } => {
            let algorithm = if xchacha { Algorithm::XChaCha20Poly1305 } else { Algorithm::Aes256Gcm };
            let nonce = &nonce[..algorithm.nonce_len()];
            let mut open_key = SessionKey::from_bytes(key);
            let seal_key = SessionKey::from_bytes(key);

            let mut envelope = seal_envelope(&plaintext, &seal_key, algorithm, nonce, with_commitment)
                .expect("sealing with a correct nonce length succeeds");

            let corrupted = match mutation {
                Mutation::None => false,
                Mutation::FlipIv { index, bit } => flip(&mut envelope.iv, index as usize, bit),
                Mutation::FlipContent { index, bit } => flip(&mut envelope.content, index as usize, bit),
                Mutation::FlipTag { index, bit } => flip(&mut envelope.tag, index as usize, bit),
                Mutation::TruncateTag => {
                    envelope.tag.pop();
                    true
                },
                Mutation::WrongKey { index, bit } => {
                    let mut bytes = key;
                    flip(&mut bytes, index as usize, bit);
                    open_key = SessionKey::from_bytes(bytes);
                    true
                },
                Mutation::SwapAlgorithm => {
                    envelope.algorithm = algorithm.fallback().unwrap_or(Algorithm::Aes256Gcm);
                    true
                },
                Mutation::DropCommitment => {
                    envelope.commitment = None;
                    false
                },
            };

            match open_envelope(&envelope, &open_key) {
                Ok(opened) => {
                    assert!(!corrupted, "corrupted envelope opened: {envelope:?}");
                    assert_eq!(opened, plaintext);
                },
                Err(_) => assert!(corrupted, "intact envelope rejected"),
            }
        },
    }
});

/// Flip one bit; false if the buffer is empty.
fn flip(buffer: &mut [u8], index: usize, bit: u8) -> bool {
    if buffer.is_empty() {
        return false;
    }
    let len = buffer.len();
    buffer[index % len] ^= 1 << (bit % 8);
    true
}
