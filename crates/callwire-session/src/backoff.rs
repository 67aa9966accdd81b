//! Reconnection backoff: how long to wait before the next connect attempt.
//!
//! [`BackoffPolicy`] is a pure function of the attempt number. Waiting is
//! delegated to a [`Timer`] so the client transport can be driven without
//! real delays in tests.

use std::future::Future;
use std::time::Duration;

use futures_util::future::BoxFuture;
use rand::Rng;
use tracing::warn;

/// Exponential backoff with a ceiling and a retry budget.
///
/// ```text
/// delay(n) = min(min_delay * factor^(n-1), max_delay)     n = 1..=max_attempts
/// ```
///
/// With the defaults that is 1s, 2s, 4s, 8s, 8s, … for up to 100 retries.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// How many retries follow the first failed attempt.
    pub max_attempts: u32,
    /// Growth factor between consecutive delays. Values below 1 are raised
    /// to 1 by [`validated`](Self::validated).
    pub factor: f64,
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Ceiling for every delay.
    pub max_delay: Duration,
    /// Multiply each delay by a random factor in `[1, 2)` before capping,
    /// so clients that dropped together don't retry in lockstep. Delays are
    /// no longer monotonic when this is on.
    pub randomize: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            factor: 2.0,
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(8000),
            randomize: false,
        }
    }
}

impl BackoffPolicy {
    /// Clamp out-of-range values so the delay sequence is well formed.
    ///
    /// - `factor` below 1 (or NaN) becomes 1.
    /// - `max_delay` below `min_delay` is raised to `min_delay`.
    pub fn validated(mut self) -> Self {
        if !(self.factor >= 1.0) {
            warn!(factor = self.factor, "backoff factor below 1, using 1");
            self.factor = 1.0;
        }
        if self.max_delay < self.min_delay {
            warn!(
                min = ?self.min_delay,
                max = ?self.max_delay,
                "backoff max_delay below min_delay, raising it"
            );
            self.max_delay = self.min_delay;
        }
        self
    }

    /// Delay to wait after failed attempt `attempt` (1-based), or `None`
    /// once the retry budget is spent.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let jitter = if self.randomize {
            rand::rng().random_range(1.0..2.0)
        } else {
            1.0
        };
        Some(self.scaled(attempt, jitter))
    }

    /// The delays for attempts `1..=max_attempts`, without randomization.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(|attempt| self.scaled(attempt, 1.0))
    }

    fn scaled(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let min_ms = self.min_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let ms = (jitter * min_ms * self.factor.powi(exponent)).round();
        Duration::from_millis(ms.min(max_ms) as u64)
    }
}

/// Schedules the wait between connect attempts.
pub trait Timer: Send + Sync + 'static {
    /// Returns a future that completes after `delay`.
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()>;
}

/// [`Timer`] backed by `tokio::time`; honors `tokio::time::pause()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(delay))
    }
}

impl<F, Fut> Timer for F
where
    F: Fn(Duration) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        Box::pin(self(delay))
    }
}
