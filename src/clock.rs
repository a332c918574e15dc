//! Time sources.
//!
//! Every time-dependent component takes an `Arc<dyn Clock>` so tests and
//! simulations can drive time explicitly with [`ManualClock`].

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

/// Milliseconds since the Unix epoch (UTC).
///
/// Store scores, stored leak timestamps and waiting intervals all use this unit.
pub type Ticks = i64;

/// Convert a duration to ticks, saturating at `i64::MAX`.
pub fn duration_to_ticks(duration: Duration) -> Ticks {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Convert ticks back to a UTC timestamp.
pub fn ticks_to_datetime(ticks: Ticks) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ticks)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Source of the current UTC instant.
pub trait Clock: Send + Sync + Debug {
    /// Get the current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Get the current instant as [`Ticks`].
    fn now_ticks(&self) -> Ticks {
        self.now().timestamp_millis()
    }
}

/// Wall clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }

    /// Create a shareable system clock.
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying instant, so advancing one clone advances
/// every component holding another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a clock frozen at the given tick.
    pub fn at_ticks(ticks: Ticks) -> Self {
        Self::new(ticks_to_datetime(ticks))
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock();
        *current += chrono::Duration::milliseconds(duration_to_ticks(duration));
    }

    /// Set the clock to a specific instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.current.lock() = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock::new();
        let t1 = clock.now_ticks();
        std::thread::sleep(Duration::from_millis(5));
        assert!(clock.now_ticks() >= t1);
    }

    #[test]
    fn test_manual_clock_advance_and_set() {
        let clock = ManualClock::at_ticks(1_000);
        assert_eq!(clock.now_ticks(), 1_000);

        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_ticks(), 3_000);

        clock.set(ticks_to_datetime(42_000));
        assert_eq!(clock.now_ticks(), 42_000);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::at_ticks(0);
        let other = clock.clone();
        other.advance(Duration::from_millis(250));
        assert_eq!(clock.now_ticks(), 250);
    }
}
