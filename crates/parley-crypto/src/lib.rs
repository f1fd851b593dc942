//! Parley Cryptographic Primitives
//!
//! Cryptographic building blocks for Parley. Pure functions with
//! deterministic outputs. Callers provide random bytes (key seeds, nonces) for
//! deterministic testing; the stateful engine in `parley-core` wires these to
//! a secure random source.
//!
//! # Key Lifecycle
//!
//! Every conversation uses a single session key agreed between two devices.
//! Each side generates an ephemeral X25519 key pair, exchanges the public half
//! and derives the same 32-byte key independently. The key is never
//! transmitted.
//!
//! ```text
//! Ephemeral X25519 Key Pair (per handshake)
//!        │
//!        ▼
//! X25519(secret, peer public) → shared point
//!        │
//!        ▼
//! HKDF-SHA256 (fixed salt, context info) → Session Key (32 bytes)
//!        │
//!        ▼
//! AEAD (AES-256-GCM or XChaCha20-Poly1305) → Encrypted Envelope
//! ```
//!
//! Rotation replaces the session key with a freshly agreed one; keys are never
//! mutated in place.
//!
//! # Security
//!
//! Authenticity:
//! - Both ciphers are AEADs; a failed tag rejects the message
//! - The algorithm tag in the envelope selects the cipher, never the content
//!
//! Key commitment:
//! - Optional truncated `SHA-256(label ‖ key ‖ iv)` binds the envelope to the
//!   key the sender used
//! - Checked in constant time before any decryption is attempted
//!
//! Hygiene:
//! - Secret keys and session keys are zeroized on drop
//! - `Debug` output never contains key material

#![forbid(unsafe_code)]

pub mod aead;
pub mod commitment;
pub mod envelope;
pub mod error;
pub mod fingerprint;
pub mod keys;

pub use aead::{Algorithm, TAG_SIZE, open, seal};
pub use commitment::{COMMITMENT_SIZE, compute_commitment, verify_commitment};
pub use envelope::{EncryptedEnvelope, open_envelope, seal_envelope};
pub use error::CryptoError;
pub use fingerprint::{FINGERPRINT_SYMBOLS, fingerprint};
pub use keys::{CURVE, KEY_SIZE, KeyPair, PublicKey, SecretKey, SessionKey, derive_session_key};
