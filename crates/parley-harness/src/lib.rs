//! Deterministic simulation environment for Parley testing.
//!
//! [`SimEnv`] implements [`Environment`] with a seeded RNG and a virtual
//! clock that only moves when the test says so. Clones share state, so a
//! test can hold one handle and advance time under a component that owns
//! another.

#![forbid(unsafe_code)]
#![allow(clippy::disallowed_types, reason = "Locking simple RNG and clock state")]

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use parley_core::env::{EntropyError, Environment};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Wall clock reading at virtual time zero (2023-11-14T22:13:20Z).
pub const SIM_EPOCH_SECS: u64 = 1_700_000_000;

struct SimState {
    rng: ChaCha20Rng,
    elapsed: Duration,
    entropy_available: bool,
}

/// Simulated environment with virtual time and seeded randomness.
#[derive(Clone)]
pub struct SimEnv {
    base: Instant,
    state: Arc<Mutex<SimState>>,
}

impl SimEnv {
    /// Environment whose random stream is fully determined by `seed`.
    #[allow(clippy::disallowed_methods)]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            base: Instant::now(),
            state: Arc::new(Mutex::new(SimState {
                rng: ChaCha20Rng::seed_from_u64(seed),
                elapsed: Duration::ZERO,
                entropy_available: true,
            })),
        }
    }

    /// Move the virtual clock forward.
    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        state.elapsed += by;
        tracing::trace!(elapsed = ?state.elapsed, "virtual clock advanced");
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    /// Make [`Environment::try_random_bytes`] fail, simulating a broken
    /// entropy source.
    pub fn set_entropy_available(&self, available: bool) {
        self.lock().entropy_available = available;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv").field("elapsed", &self.elapsed()).finish_non_exhaustive()
    }
}

impl Environment for SimEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        self.base + self.lock().elapsed
    }

    fn wall_clock_secs(&self) -> u64 {
        SIM_EPOCH_SECS + self.lock().elapsed.as_secs()
    }

    fn wall_clock_millis(&self) -> u64 {
        SIM_EPOCH_SECS * 1000 + self.lock().elapsed.as_millis() as u64
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        self.advance(duration);
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.lock().rng.fill_bytes(buffer);
    }

    fn try_random_bytes(&self, buffer: &mut [u8]) -> Result<(), EntropyError> {
        let mut state = self.lock();
        if !state.entropy_available {
            return Err(EntropyError { reason: "simulated entropy failure".to_string() });
        }
        state.rng.fill_bytes(buffer);
        Ok(())
    }
}
