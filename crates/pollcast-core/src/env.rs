//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (time, randomness).
//! Production drivers use real time and OS randomness; tests can supply a
//! virtual clock and seeded RNG.

use std::time::Duration;

/// Abstract environment providing time, randomness, and async sleep.
///
/// Implementations MUST guarantee that `now()` never goes backwards and
/// that `random_bytes()` uses cryptographically secure entropy in
/// production.
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`; simulation
    /// environments may use virtual time.
    type Instant: Copy
        + Ord
        + Send
        + Sync
        + std::ops::Sub<Output = Duration>
        + std::ops::Add<Duration, Output = Self::Instant>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// The only async method in the trait; used by driver code (poll
    /// expiry timers), never by protocol logic.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`, e.g. for connection or poll identifiers.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}
