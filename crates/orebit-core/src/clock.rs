//! Clock and jitter sources
//!
//! Wall-clock time and bounded randomness are the only non-deterministic
//! inputs of the rate calculator, so both sit behind small traits that tests
//! replace with manual implementations.

use crate::types::UserId;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Real time
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) -> DateTime<Utc> {
        let mut now = self.now.lock();
        *now += by;
        *now
    }

    /// Jump to an absolute instant
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Bounded multiplicative jitter, drawn once per evaluation window.
///
/// Implementations must return the same factor for the same
/// `(user, window)` pair so that every session credits the same amount.
pub trait JitterSource: Send + Sync {
    fn factor(&self, user: &UserId, window: u64) -> f64;
}

/// ChaCha-seeded jitter in `[1 - amplitude, 1 + amplitude]`
#[derive(Clone, Debug)]
pub struct SeededJitter {
    amplitude: f64,
    salt: [u8; 32],
}

impl SeededJitter {
    pub fn new(amplitude: f64, salt: &[u8]) -> Self {
        Self {
            amplitude: amplitude.clamp(0.0, 1.0),
            salt: *blake3::hash(salt).as_bytes(),
        }
    }

    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    fn seed(&self, user: &UserId, window: u64) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.salt);
        hasher.update(&user.seed_bytes());
        hasher.update(&window.to_le_bytes());
        *hasher.finalize().as_bytes()
    }
}

impl JitterSource for SeededJitter {
    fn factor(&self, user: &UserId, window: u64) -> f64 {
        let mut rng = ChaCha8Rng::from_seed(self.seed(user, window));
        1.0 + rng.gen_range(-self.amplitude..=self.amplitude)
    }
}

/// Constant factor, used where randomness would obscure a test
#[derive(Clone, Copy, Debug)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn factor(&self, _user: &UserId, _window: u64) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);

        assert_eq!(clock.now(), start);
        clock.advance(Duration::hours(2));
        assert_eq!(clock.now(), start + Duration::hours(2));
    }

    #[test]
    fn test_jitter_is_stable_per_window() {
        let jitter = SeededJitter::new(0.05, b"test");
        let user = UserId::from("alice");

        assert_eq!(jitter.factor(&user, 7), jitter.factor(&user, 7));
    }

    #[test]
    fn test_jitter_bounds() {
        let jitter = SeededJitter::new(0.1, b"bounds");
        let user = UserId::from("bob");

        for window in 0..1_000 {
            let f = jitter.factor(&user, window);
            assert!((0.9..=1.1).contains(&f), "factor {} out of bounds", f);
        }
    }

    #[test]
    fn test_zero_amplitude_is_identity() {
        let jitter = SeededJitter::new(0.0, b"none");
        assert_eq!(jitter.factor(&UserId::from("carol"), 3), 1.0);
    }
}
