//! Clock abstraction used everywhere the coordinator measures or waits on
//! time: the registry's heartbeat sweep, the delegator's deadline monitor,
//! and the pipeline controller's stage timeouts all take a `SharedClock`
//! rather than calling `tokio::time`/`SystemTime` directly, so tests can
//! swap in a `SimulatedClock` and run those sweeps without waiting out
//! real intervals.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::time::sleep as tokio_sleep;

/// A source of wall-clock time and sleeps, injected wherever production
/// code would otherwise call `SystemTime::now()` or `tokio::time::sleep`.
#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Suspends the current task for `duration`.
    async fn sleep(&self, duration: Duration);

    /// The current wall-clock time.
    #[must_use]
    fn now(&self) -> SystemTime;

    /// An opaque instant, for measuring elapsed durations.
    #[must_use]
    fn instant(&self) -> Instant;

    /// Whether this clock collapses `sleep` calls instead of honoring them.
    #[must_use]
    fn is_accelerated(&self) -> bool {
        false
    }
}

/// The real clock: sleeps for the requested duration, reads the OS clock.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Creates the real clock.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Clock for SystemClock {
    async fn sleep(&self, duration: Duration) {
        tokio_sleep(duration).await;
    }

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// A clock for tests: by default collapses every `sleep` to near-zero so a
/// deadline/heartbeat sweep loop can be exercised without actually waiting,
/// while `now`/`instant` still read the real clock so timestamp ordering
/// assertions stay meaningful.
#[derive(Debug, Clone, Default)]
pub struct SimulatedClock {
    accelerated: bool,
}

impl SimulatedClock {
    /// A clock that collapses every sleep.
    #[must_use]
    pub fn new() -> Self {
        Self { accelerated: true }
    }

    /// A clock that sleeps for real durations — for integration tests that
    /// need actual timing (e.g. racing a background sweep against a timer).
    #[must_use]
    pub fn with_real_delays() -> Self {
        Self { accelerated: false }
    }
}

#[async_trait]
impl Clock for SimulatedClock {
    async fn sleep(&self, duration: Duration) {
        if !self.accelerated {
            tokio_sleep(duration).await;
        } else if duration > Duration::from_millis(1) {
            // Still yield once, rather than returning immediately, so
            // callers relying on a sleep point to let other tasks run keep
            // working under the accelerated clock.
            tokio_sleep(Duration::from_millis(1)).await;
        }
    }

    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    fn is_accelerated(&self) -> bool {
        self.accelerated
    }
}

/// A clock shared across components behind an `Arc`.
pub type SharedClock = Arc<dyn Clock>;

/// The clock the running coordinator process uses.
#[must_use]
pub fn production_time_provider() -> SharedClock {
    Arc::new(SystemClock::new())
}

/// An accelerated clock for unit tests.
#[must_use]
pub fn test_time_provider() -> SharedClock {
    Arc::new(SimulatedClock::new())
}

/// A real-delay clock for integration tests that need actual elapsed time.
#[must_use]
pub fn integration_test_time_provider() -> SharedClock {
    Arc::new(SimulatedClock::with_real_delays())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_clock_collapses_long_sleeps() {
        let clock = SimulatedClock::new();
        let start = Instant::now();

        clock.sleep(Duration::from_secs(10)).await;

        let elapsed = start.elapsed();
        assert!(elapsed < Duration::from_millis(100), "accelerated sleep took too long: {elapsed:?}");
    }

    #[tokio::test]
    async fn simulated_clock_with_real_delays_actually_waits() {
        let clock = SimulatedClock::with_real_delays();
        let start = Instant::now();

        clock.sleep(Duration::from_millis(50)).await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50), "real-delay sleep was too short: {elapsed:?}");
    }

    #[tokio::test]
    async fn system_clock_actually_sleeps() {
        let clock = SystemClock::new();
        let start = Instant::now();

        clock.sleep(Duration::from_millis(50)).await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50), "real sleep was too short: {elapsed:?}");
    }

    #[test]
    fn is_accelerated_reflects_construction() {
        assert!(SimulatedClock::new().is_accelerated());
        assert!(!SimulatedClock::with_real_delays().is_accelerated());
        assert!(!SystemClock::new().is_accelerated());
    }
}
