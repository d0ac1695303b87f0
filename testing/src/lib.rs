//! # Cartkeeper Testing
//!
//! In-memory collaborators and helpers for testing the cart runtime.
//!
//! This crate provides:
//! - [`mocks::ManualClock`]: deterministic, hand-advanced time
//! - [`InMemoryCartStore`]: compare-and-swap aggregate store behind a mutex
//! - [`InMemoryReservationLock`]: TTL-bound reservations driven by a clock
//! - [`MockPriceOracle`]: canned prices with injectable transient failures
//!
//! ## Example
//!
//! ```
//! use cartkeeper_core::environment::Clock;
//! use cartkeeper_testing::test_clock;
//! use chrono::Duration;
//!
//! let clock = test_clock();
//! let start = clock.now();
//! clock.advance(Duration::minutes(16));
//! assert_eq!(clock.now() - start, Duration::minutes(16));
//! ```

use cartkeeper_core::environment::Clock;
use chrono::{DateTime, Utc};

pub mod lock;
pub mod pricing;
pub mod store;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Hand-advanced clock for deterministic tests.
    ///
    /// Clones share the same instant, so a clock handed to the service and to
    /// the lock store moves for both.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock stopped at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward by `by`.
        #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }

        /// Jump to `time`.
        #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap() = time;
        }
    }

    impl Clock for ManualClock {
        #[allow(clippy::unwrap_used)] // Test mock: mutex poisoning is a test failure
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default manual clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> ManualClock {
        ManualClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a `tracing` subscriber writing to the test harness.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use lock::InMemoryReservationLock;
pub use mocks::{ManualClock, test_clock};
pub use pricing::MockPriceOracle;
pub use store::InMemoryCartStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_the_instant() {
        let clock = test_clock();
        let other = clock.clone();
        let start = clock.now();

        other.advance(chrono::Duration::seconds(30));

        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));
    }
}
