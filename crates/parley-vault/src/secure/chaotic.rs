//! Chaotic secure-store wrapper for fault injection testing
//!
//! Randomly fails operations so tests can check that the vault degrades to
//! the obfuscated path and never loses a key when the keystore flakes.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use zeroize::Zeroizing;

use super::SecureStore;
use crate::error::StorageError;

/// Secure store wrapper that randomly injects failures.
///
/// Delegates to an inner store but fails each call with probability
/// `failure_rate`. The RNG is seeded, so a failing run replays exactly.
#[derive(Clone)]
pub struct ChaoticSecureStore<S: SecureStore> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    rng: Arc<Mutex<ChaoticRng>>,
    injected: Arc<AtomicUsize>,
}

/// Linear congruential generator, fast and reproducible.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    /// Next value in [0.0, 1.0)
    #[allow(clippy::cast_precision_loss)]
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: SecureStore> ChaoticSecureStore<S> {
    /// Wrap `inner` with the default seed.
    ///
    /// `failure_rate` is clamped to [0.0, 1.0].
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Wrap `inner` with an explicit seed for reproducible chaos.
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        Self {
            inner,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Arc::new(Mutex::new(ChaoticRng { state: seed })),
            injected: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying store (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of failures injected so far.
    pub fn injected_failures(&self) -> usize {
        self.injected.load(Ordering::Relaxed)
    }

    fn inject(&self) -> Result<(), StorageError> {
        let roll = self.rng.lock().unwrap_or_else(PoisonError::into_inner).next();
        if roll < self.failure_rate {
            self.injected.fetch_add(1, Ordering::Relaxed);
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<S: SecureStore> SecureStore for ChaoticSecureStore<S> {
    fn store(&self, id: &str, secret: &[u8]) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.store(id, secret)
    }

    fn load(&self, id: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StorageError> {
        self.inject()?;
        self.inner.load(id)
    }

    fn remove(&self, id: &str) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.remove(id)
    }
}
