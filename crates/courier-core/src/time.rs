//! Time abstraction for testable timing behavior.
//!
//! All retry scheduling, circuit-breaker windows, and health-age checks go
//! through a `Clock` so tests can advance virtual time instead of sleeping.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};

/// Clock abstraction for timestamps and delays.
///
/// Production code uses [`RealClock`]; tests inject [`TestClock`] to control
/// time deterministically.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleeps for the given duration.
    ///
    /// Maps to `tokio::time::sleep` in production; test clocks advance
    /// virtual time and return immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock backed by system time and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Deterministic clock for tests.
///
/// Time only moves when [`advance`](TestClock::advance) is called or when a
/// component sleeps through the clock, which advances virtual time by the
/// full requested duration and resolves immediately.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Microseconds since the UNIX epoch.
    micros: Arc<AtomicI64>,
}

impl TestClock {
    /// Creates a test clock starting at the current system time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a test clock starting at a specific instant.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self { micros: Arc::new(AtomicI64::new(start.timestamp_micros())) }
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        let delta = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        self.micros.fetch_add(delta, Ordering::AcqRel);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let micros = self.micros.load(Ordering::Acquire);
        Utc.timestamp_micros(micros).single().unwrap_or_else(Utc::now)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(std::future::ready(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_explicitly() {
        let clock = TestClock::new();
        let before = clock.now();

        clock.advance(Duration::from_secs(90));

        let elapsed = clock.now() - before;
        assert_eq!(elapsed.num_seconds(), 90);
    }

    #[tokio::test]
    async fn test_clock_sleep_advances_virtual_time() {
        let clock = TestClock::new();
        let before = clock.now();

        clock.sleep(Duration::from_secs(30)).await;

        assert_eq!((clock.now() - before).num_seconds(), 30);
    }

    #[test]
    fn clones_share_the_same_timeline() {
        let clock = TestClock::new();
        let other = clock.clone();

        clock.advance(Duration::from_secs(5));

        assert_eq!(clock.now(), other.now());
    }
}
