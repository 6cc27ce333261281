// src/core/clock.rs

//! A single injected time source for every timer, TTL, and stabilization window.
//!
//! All components take a `Clock` instead of calling `tokio::time` directly, so
//! tests can drive time deterministically with `tokio::time::pause()` and
//! `tokio::time::advance()`.

use std::time::Duration;
use tokio::time::Instant;

/// The process-wide time source. Cheap to clone and pass around.
///
/// The default implementation delegates to the tokio timer wheel, which honors
/// the paused test clock. Holding every time read and sleep behind this type
/// keeps wall-clock access out of deterministic code paths like the FSM.
#[derive(Debug, Clone, Default)]
pub struct Clock;

impl Clock {
    pub fn new() -> Self {
        Self
    }

    /// The current monotonic instant.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Sleeps for the given duration. Cancellable by dropping the future.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Sleeps until the given deadline.
    pub async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }

    /// Runs `fut` with a deadline, mapping expiry to `None`.
    pub async fn timeout<F, T>(&self, duration: Duration, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout(duration, fut).await.ok()
    }

    /// A periodic ticker. The first tick completes immediately, matching
    /// `tokio::time::interval`.
    pub fn interval(&self, period: Duration) -> tokio::time::Interval {
        tokio::time::interval(period)
    }
}
