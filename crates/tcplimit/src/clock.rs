//! Clocks used to pace connections.

use std::future::Future;
use std::time::{Duration, Instant};

/// A monotonic time source that can also put a task to sleep.
///
/// Production code uses [`SystemClock`]; tests substitute something
/// deterministic (see `mock::MockClock` with the `testing` feature).
pub trait Clock: Clone + Send + Sync + 'static {
    /// A future returned by [`Clock::sleep`].
    type SleepFuture: Future<Output = ()> + Send + 'static;

    /// Return the current instant.
    fn now(&self) -> Instant;

    /// Return a future that completes once `duration` has elapsed.
    ///
    /// A zero duration may still yield to the runtime once before
    /// completing.  [`LimitedConn`](crate::LimitedConn) never asks for one:
    /// it skips the sleep when there is nothing to wait for.
    fn sleep(&self, duration: Duration) -> Self::SleepFuture;
}

/// The real monotonic clock, sleeping on the tokio timer.
///
/// Sleeping needs a tokio runtime with its time driver enabled.
#[derive(Clone, Copy, Debug, Default)]
#[allow(clippy::exhaustive_structs)]
pub struct SystemClock;

impl Clock for SystemClock {
    type SleepFuture = tokio::time::Sleep;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Self::SleepFuture {
        tokio::time::sleep(duration)
    }
}
