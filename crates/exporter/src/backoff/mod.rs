use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::RetryConfig;

/// Exponential backoff for the attempts of a single batch.
///
/// Delays grow by `multiplier` from `initial_interval` up to `max_interval`,
/// each randomized by `randomization_factor`. Once the time elapsed since
/// creation plus the next delay would exceed `max_elapsed_time`, the budget is
/// spent and `next_backoff` returns `None`. A zero `max_elapsed_time` never
/// runs out.
#[derive(Debug)]
pub struct ExponentialBackoff {
    current: Duration,
    max_interval: Duration,
    max_elapsed_time: Duration,
    multiplier: f64,
    randomization_factor: f64,
    start: Instant,
}

impl ExponentialBackoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            current: config.initial_interval,
            max_interval: config.max_interval,
            max_elapsed_time: config.max_elapsed_time,
            multiplier: config.multiplier,
            randomization_factor: config.randomization_factor,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Delay before the next attempt, or `None` when the budget is spent.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let next = randomize(self.current, self.randomization_factor);
        self.grow();
        self.within_budget(next).then_some(next)
    }

    /// Like `next_backoff`, but with the delay dictated by the server
    /// (`Retry-After`). The interval still grows.
    pub fn next_backoff_with(&mut self, delay: Duration) -> Option<Duration> {
        self.grow();
        self.within_budget(delay).then_some(delay)
    }

    // `delay` may come from a server header, so the sum can overflow.
    fn within_budget(&self, delay: Duration) -> bool {
        self.max_elapsed_time.is_zero()
            || self
                .elapsed()
                .checked_add(delay)
                .is_some_and(|end| end <= self.max_elapsed_time)
    }

    fn grow(&mut self) {
        let next = self.current.as_secs_f64() * self.multiplier;
        self.current = if next >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(next)
        };
    }
}

fn randomize(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || interval.is_zero() {
        return interval;
    }
    let secs = interval.as_secs_f64();
    let delta = secs * factor;
    let jittered = rand::rng().random_range((secs - delta)..=(secs + delta));
    Duration::from_secs_f64(jittered.max(0.0))
}
