//! Geometric backoff with jitter, bounded, reset on success.
//!
//! Reference sequence for `initial=1s, multiplier=2, jitter=1/3, max=341.333s`:
//! 0.67–1.33, 1.33–2.67, 2.67–5.33, 5.33–10.67, 10.67–21.33, 21.33–42.67,
//! 42.67–85.33, 85.33–170.67, 170.67–341.33, 341.33, …

use std::time::Duration;

use rand::Rng;

/// Per-session backoff state. Not `Clone`: each transport/credential loop
/// owns one instance and resets it on its own successful connect.
#[derive(Debug)]
pub struct RetryPolicy {
    initial: Duration,
    multiplier: f64,
    jitter: f64,
    max: Duration,
    current: Duration,
}

impl RetryPolicy {
    /// `jitter` is the fraction of the interval to jitter by in each
    /// direction (default `1/3`); `multiplier` defaults to `2.0`.
    pub fn new(initial: Duration, multiplier: f64, jitter: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier,
            jitter,
            max,
            current: initial,
        }
    }

    pub fn with_defaults(initial: Duration, max: Duration) -> Self {
        Self::new(initial, 2.0, 1.0 / 3.0, max)
    }

    /// Returns the next backoff delay, applying jitter to the current
    /// interval, then growing the interval (capped at `max`) for next time.
    pub fn next(&mut self) -> Duration {
        let jittered = jitter_duration(self.current, self.jitter);
        let grown = self.current.mul_f64(self.multiplier);
        self.current = if grown > self.max { self.max } else { grown };
        jittered
    }

    /// Resets the backoff state to its initial interval. Must be called on
    /// every successful connect.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

fn jitter_duration(base: Duration, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    let factor = rand::rng().random_range(-jitter..=jitter);
    let scaled = base.as_secs_f64() * (1.0 + factor);
    Duration::from_secs_f64(scaled.max(0.0))
}
