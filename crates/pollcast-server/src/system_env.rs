//! Production Environment implementation using system time and RNG.
//!
//! `SystemEnv` backs the [`Environment`] trait with real system
//! resources: monotonic `std::time::Instant`, Tokio async sleep for
//! wall-clock delays, and OS cryptographic randomness via getrandom.
//! Production behavior is therefore non-deterministic, but carries
//! real-world timing and security-grade randomness.

use std::time::Duration;

use pollcast_core::Environment;

/// Production environment using system time and cryptographic RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. This is intentional: a server without
/// functioning cryptographic randomness cannot operate securely, and RNG
/// failure indicates OS-level problems.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable - server cannot operate securely");
    }
}
