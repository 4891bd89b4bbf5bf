//! Time source and id allocation.
//!
//! Everything that reads the wall clock or mints an identifier goes through
//! this module so tests can pin time and ids deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Injectable time source.
pub trait Clock: Send + Sync {
    /// Current UTC instant.
    fn now(&self) -> DateTime<Utc>;

    /// Strictly increasing value for latency measurement; not wall time.
    fn monotonic(&self) -> std::time::Duration;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> std::time::Duration {
        self.origin.elapsed()
    }
}

/// Test clock with settable time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    origin: Instant,
}

impl ManualClock {
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
            origin: Instant::now(),
        }
    }

    /// Advance the clock by whole seconds.
    pub fn advance_secs(&self, secs: i64) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += ChronoDuration::seconds(secs);
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|g| *g).unwrap_or_else(|_| Utc::now())
    }

    fn monotonic(&self) -> std::time::Duration {
        self.origin.elapsed()
    }
}

/// Process-wide monotonic id allocator for ETA samples, advisories,
/// reroutes, routes, and audit events.
///
/// Seeded from the repository's high-water mark at boot so a restarted
/// service never reissues an id.
#[derive(Debug)]
pub struct IdGen {
    next: AtomicU64,
}

impl IdGen {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::at(start);
        assert_eq!(clock.now(), start);

        clock.advance_secs(30);
        assert_eq!(clock.now(), start + ChronoDuration::seconds(30));
    }

    #[test]
    fn test_id_gen_monotonic() {
        let ids = IdGen::starting_at(100);
        assert_eq!(ids.next(), 100);
        assert_eq!(ids.next(), 101);
        assert_eq!(ids.next(), 102);
    }

    #[test]
    fn test_id_gen_never_zero() {
        let ids = IdGen::starting_at(0);
        assert_eq!(ids.next(), 1);
    }

    #[test]
    fn test_system_clock_monotonic_increases() {
        let clock = SystemClock::new();
        let a = clock.monotonic();
        let b = clock.monotonic();
        assert!(b >= a);
    }
}
