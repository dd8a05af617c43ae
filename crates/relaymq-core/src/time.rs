//! Clock abstraction for publish timestamps, claim eligibility and pauses.
//!
//! The delivery engine binds the clock's `now` into the claim query instead
//! of reading the database clock, so tests can move a row past its
//! `check_at` by advancing a [`TestClock`].

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};

/// Clock abstraction for time operations.
///
/// Production code uses `RealClock`, tests inject a `TestClock`.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current wall-clock time.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    ///
    /// In production this maps to `tokio::time::sleep`, in tests this can
    /// advance virtual time immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Real clock implementation using system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test clock for deterministic time control.
///
/// Time is kept in whole microseconds, the resolution PostgreSQL stores for
/// `TIMESTAMPTZ`, so timestamps read back from the database compare equal to
/// the instants this clock handed out. Clones share the same time.
#[derive(Debug, Clone)]
pub struct TestClock {
    micros: Arc<AtomicI64>,
}

impl TestClock {
    /// Creates a test clock starting at the current time.
    pub fn new() -> Self {
        Self::with_start_time(Utc::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn with_start_time(start: DateTime<Utc>) -> Self {
        Self { micros: Arc::new(AtomicI64::new(start.timestamp_micros())) }
    }

    /// Advances the clock by the specified duration.
    pub fn advance(&self, duration: Duration) {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        let _ = self.micros.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some(current.saturating_add(micros))
        });
    }

    /// Jumps the clock to a specific time, forwards or backwards.
    pub fn jump_to(&self, time: DateTime<Utc>) {
        self.micros.store(time.timestamp_micros(), Ordering::Release);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_utc(&self) -> DateTime<Utc> {
        let micros = self.micros.load(Ordering::Acquire);
        DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
