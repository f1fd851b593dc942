//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (time, randomness). Tests
//! drive a virtual clock and a seeded RNG; production uses the OS.

use std::{
    fmt,
    ops::{Add, Sub},
    time::Duration,
};

use thiserror::Error;

/// The secure random source could not produce bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("entropy unavailable: {reason}")]
pub struct EntropyError {
    /// What the random source reported
    pub reason: String,
}

/// Abstract environment providing time, randomness, and async primitives.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant type.
    ///
    /// Production uses `std::time::Instant`; simulations may offset it by a
    /// virtual clock.
    type Instant: Copy
        + Ord
        + Send
        + Sync
        + fmt::Debug
        + Sub<Output = Duration>
        + Add<Duration, Output = Self::Instant>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Seconds since the Unix epoch. Used for persisted timestamps only.
    fn wall_clock_secs(&self) -> u64;

    /// Milliseconds since the Unix epoch, for wire timestamps.
    fn wall_clock_millis(&self) -> u64 {
        self.wall_clock_secs().saturating_mul(1000)
    }

    /// Sleeps for the specified duration.
    ///
    /// The only async method in the trait; used by driver code, never by the
    /// state machines.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Fills the buffer, reporting an unavailable random source instead of
    /// aborting.
    ///
    /// Key generation goes through this method so a broken entropy source
    /// surfaces as an error.
    fn try_random_bytes(&self, buffer: &mut [u8]) -> Result<(), EntropyError> {
        self.random_bytes(buffer);
        Ok(())
    }

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u128`. Used for message ids.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }
}
