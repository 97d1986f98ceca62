//! Monotonic time source for the reactor.

use std::time::Instant;

/// Monotonic clock reporting fractional seconds since its creation.
///
/// Every timestamp the driver and its backend exchange comes from the same
/// `Clock`, so timer expirations stay comparable for the lifetime of the
/// loop regardless of wall-clock adjustments.
#[derive(Debug, Clone)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Seconds elapsed since this clock was created.
    pub fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_monotonic() {
        let clock = Clock::new();
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }

    #[test]
    fn test_advances_with_real_time() {
        let clock = Clock::new();
        let before = clock.now();
        thread::sleep(Duration::from_millis(5));
        assert!(clock.now() - before >= 0.005);
    }
}
