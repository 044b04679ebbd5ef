//! Monotonic time helpers
//!
//! All state machines in the core work on millisecond deadlines over a
//! monotonic clock. Handlers take the current time as a parameter so tests
//! can drive them with synthetic clocks.

use std::sync::OnceLock;
use std::time::Instant;

/// A point on the monotonic clock, in milliseconds since process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SteadyTime(pub i64);

impl SteadyTime {
    /// Milliseconds elapsed since \p earlier, negative if earlier is later.
    #[must_use]
    pub fn elapsed_since(self, earlier: SteadyTime) -> i64 {
        self.0 - earlier.0
    }
}

impl std::ops::Add<i64> for SteadyTime {
    type Output = SteadyTime;

    fn add(self, ms: i64) -> SteadyTime {
        SteadyTime(self.0 + ms)
    }
}

impl std::ops::Sub for SteadyTime {
    type Output = i64;

    fn sub(self, rhs: SteadyTime) -> i64 {
        self.0 - rhs.0
    }
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current monotonic time.
#[must_use]
pub fn steady_now() -> SteadyTime {
    let epoch = EPOCH.get_or_init(Instant::now);
    SteadyTime(epoch.elapsed().as_millis() as i64)
}

/// Current wall clock in milliseconds since the Unix epoch.
#[must_use]
pub fn system_now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_time_arithmetic() {
        let t0 = SteadyTime(1_000);
        let t1 = t0 + 250;
        assert_eq!(t1.elapsed_since(t0), 250);
        assert_eq!(t1 - t0, 250);
        assert!(t1 > t0);
    }

    #[test]
    fn steady_now_is_monotonic() {
        let a = steady_now();
        let b = steady_now();
        assert!(b >= a);
    }
}
