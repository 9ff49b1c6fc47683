//! Time source used for window math, quota periods and sleeping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Source of wall-clock time and suspension.
///
/// Wall-clock (not monotonic) time is used because window entries are
/// shared between processes.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the current task for `duration`.
    async fn sleep(&self, duration: Duration);

    /// Block the current thread for `duration`.
    fn sleep_blocking(&self, duration: Duration);
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn sleep_blocking(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A manually driven clock for deterministic tests.
///
/// Sleeping advances the clock by the requested duration instead of
/// waiting. Clones share the same time.
///
/// # Example
///
/// ```
/// use ratekeeper_core::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::default();
/// let start = clock.now();
/// clock.sleep_blocking(Duration::from_secs(30));
/// assert_eq!((clock.now() - start).num_seconds(), 30);
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        let delta = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock();
        *now = now.checked_add_signed(delta).unwrap_or(*now);
    }

    /// Jump to an absolute time.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.now.lock() = time;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }

    fn sleep_blocking(&self, duration: Duration) {
        self.advance(duration);
        std::thread::yield_now();
    }
}
