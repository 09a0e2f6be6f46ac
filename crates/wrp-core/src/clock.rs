//! Injectable wall-clock, so resolvers, credential loops and retry policies
//! can be driven by a fixed clock in tests instead of racing real time.

use chrono::{DateTime, Utc};

/// A source of "now". Production code uses [`SystemClock`]; tests use a
/// fixed or steppable implementation.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_support {
    use super::Clock;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;

    /// A clock that only advances when told to. Useful for deterministic
    /// expiry/backoff assertions.
    pub struct FixedClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl FixedClock {
        pub fn new(now: DateTime<Utc>) -> Self {
            Self { now: Mutex::new(now) }
        }

        pub fn set(&self, now: DateTime<Utc>) {
            *self.now.lock() = now;
        }

        pub fn advance(&self, delta: chrono::Duration) {
            let mut guard = self.now.lock();
            *guard = *guard + delta;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock()
        }
    }
}
