//! Stateful crypto engine.
//!
//! Wraps the pure primitives of `parley-crypto` with an [`Environment`] for
//! randomness and time, a cipher preference, and a short-lived cache of
//! derived session keys.
//!
//! # Cipher selection
//!
//! AES-256-GCM is preferred when the CPU accelerates AES; otherwise
//! XChaCha20-Poly1305 is used. If the preferred cipher fails the fallback is
//! tried before an error surfaces. Decryption never consults the preference:
//! the envelope's algorithm tag alone selects the cipher.
//!
//! # Derivation cache
//!
//! Keyed by SHA-256 over both full inputs, so two different key pairs can
//! never share an entry. Entries live for [`EngineConfig::cache_ttl`] and the
//! cache never grows past [`EngineConfig::cache_capacity`].

#![allow(clippy::disallowed_types, reason = "Synchronous cache access only")]

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use parley_crypto::{
    Algorithm, CryptoError, EncryptedEnvelope, KeyPair, PublicKey, SessionKey, derive_session_key,
    fingerprint, open_envelope, seal_envelope,
};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::env::Environment;

/// Default lifetime of a cached derivation.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Default maximum number of cached derivations.
pub const DEFAULT_CACHE_CAPACITY: usize = 128;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a derived key stays cached
    pub cache_ttl: Duration,
    /// Maximum number of cached derivations
    pub cache_capacity: usize,
    /// Cipher tried first when encrypting
    pub preferred: Algorithm,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            preferred: detect_preferred_algorithm(),
        }
    }
}

/// AES-256-GCM when the CPU has AES instructions, XChaCha20-Poly1305 otherwise.
pub fn detect_preferred_algorithm() -> Algorithm {
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("aes") {
            return Algorithm::Aes256Gcm;
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        if std::arch::is_aarch64_feature_detected!("aes") {
            return Algorithm::Aes256Gcm;
        }
    }
    Algorithm::XChaCha20Poly1305
}

struct CachedKey<I> {
    key: SessionKey,
    derived_at: I,
}

/// Key generation, derivation, encryption and fingerprints.
///
/// Safe to share between threads; only the derivation cache is locked.
pub struct CryptoEngine<E: Environment> {
    env: E,
    config: EngineConfig,
    cache: Mutex<HashMap<[u8; 32], CachedKey<E::Instant>>>,
}

impl<E: Environment> CryptoEngine<E> {
    /// Create an engine.
    pub fn new(env: E, config: EngineConfig) -> Self {
        debug!(preferred = %config.preferred, "crypto engine created");
        Self { env, config, cache: Mutex::new(HashMap::new()) }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Generate an ephemeral X25519 key pair.
    ///
    /// # Errors
    ///
    /// - `KeyGeneration` if the random source is unavailable
    pub fn generate_key_pair(&self) -> Result<KeyPair, CryptoError> {
        let mut seed = [0u8; 32];
        self.env
            .try_random_bytes(&mut seed)
            .map_err(|e| CryptoError::KeyGeneration { reason: e.reason })?;

        let pair = KeyPair::from_random_bytes(seed);
        seed.fill(0);
        Ok(pair)
    }

    /// Derive the session key shared with a peer, using the cache when
    /// possible.
    ///
    /// # Errors
    ///
    /// - `Derivation` if an input is not 32 bytes or the peer key is a
    ///   low-order point
    pub fn derive_shared_secret(
        &self,
        secret: &[u8],
        peer_public: &[u8],
    ) -> Result<SessionKey, CryptoError> {
        let cache_key = Self::cache_key(secret, peer_public);
        let now = self.env.now();

        {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = cache.get(&cache_key) {
                if now - entry.derived_at < self.config.cache_ttl {
                    debug!("derivation cache hit");
                    return Ok(entry.key.clone());
                }
            }
        }

        let key = derive_session_key(secret, peer_public)?;

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.retain(|_, entry| now - entry.derived_at < self.config.cache_ttl);
        if cache.len() >= self.config.cache_capacity {
            let oldest = cache.iter().min_by_key(|(_, entry)| entry.derived_at).map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                cache.remove(&oldest);
            }
        }
        if self.config.cache_capacity > 0 {
            cache.insert(cache_key, CachedKey { key: key.clone(), derived_at: now });
        }

        Ok(key)
    }

    /// Number of live cache entries.
    pub fn cached_derivations(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drop every cached derivation.
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Encrypt with the preferred cipher, falling back if it fails.
    ///
    /// # Errors
    ///
    /// - `Encryption` if every cipher failed or no nonce could be drawn
    pub fn encrypt(&self, plaintext: &[u8], key: &SessionKey) -> Result<EncryptedEnvelope, CryptoError> {
        self.seal(plaintext, key, false)
    }

    /// Encrypt and attach a key commitment.
    ///
    /// # Errors
    ///
    /// - `Encryption` if every cipher failed or no nonce could be drawn
    pub fn encrypt_with_commitment(
        &self,
        plaintext: &[u8],
        key: &SessionKey,
    ) -> Result<EncryptedEnvelope, CryptoError> {
        self.seal(plaintext, key, true)
    }

    /// Decrypt an envelope, checking its commitment first.
    ///
    /// # Errors
    ///
    /// - `Authentication` on commitment mismatch (no decryption attempted)
    /// - `Decryption` if the tag does not authenticate
    pub fn decrypt(&self, envelope: &EncryptedEnvelope, key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
        open_envelope(envelope, key).inspect_err(|e| match e {
            CryptoError::Authentication => {
                warn!(algorithm = %envelope.algorithm, "key commitment mismatch");
            },
            _ => debug!(algorithm = %envelope.algorithm, error = %e, "decryption failed"),
        })
    }

    /// [`Self::encrypt`], returning `None` on failure.
    pub fn try_encrypt(&self, plaintext: &[u8], key: &SessionKey) -> Option<EncryptedEnvelope> {
        self.encrypt(plaintext, key).inspect_err(|e| warn!(error = %e, "encryption failed")).ok()
    }

    /// [`Self::decrypt`], returning `None` on failure.
    pub fn try_decrypt(&self, envelope: &EncryptedEnvelope, key: &SessionKey) -> Option<Vec<u8>> {
        self.decrypt(envelope, key).ok()
    }

    /// Human-comparable fingerprint of a public key.
    pub fn generate_fingerprint(&self, public_key: &PublicKey) -> String {
        fingerprint(public_key)
    }

    fn seal(
        &self,
        plaintext: &[u8],
        key: &SessionKey,
        with_commitment: bool,
    ) -> Result<EncryptedEnvelope, CryptoError> {
        let candidates = [Some(self.config.preferred), self.config.preferred.fallback()];
        let mut last_error = None;

        for algorithm in candidates.into_iter().flatten() {
            let mut nonce = vec![0u8; algorithm.nonce_len()];
            if let Err(e) = self.env.try_random_bytes(&mut nonce) {
                return Err(CryptoError::Encryption { reason: e.to_string() });
            }

            match seal_envelope(plaintext, key, algorithm, &nonce, with_commitment) {
                Ok(envelope) => return Ok(envelope),
                Err(e) => {
                    warn!(%algorithm, error = %e, "cipher failed, trying fallback");
                    last_error = Some(e);
                },
            }
        }

        Err(CryptoError::Encryption {
            reason: last_error.map_or_else(|| "no cipher available".to_string(), |e| e.to_string()),
        })
    }

    fn cache_key(secret: &[u8], peer_public: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update((secret.len() as u64).to_be_bytes());
        hasher.update(secret);
        hasher.update(peer_public);
        hasher.finalize().into()
    }
}

impl<E: Environment> std::fmt::Debug for CryptoEngine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEngine")
            .field("preferred", &self.config.preferred)
            .field("cached_derivations", &self.cached_derivations())
            .finish_non_exhaustive()
    }
}
