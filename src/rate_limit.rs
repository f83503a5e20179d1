//! Per-origin politeness window.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Tracks the next allowed request time per origin.
///
/// Owned exclusively by the scheduler; workers receive the computed deadline
/// inside their job and sleep until it.
#[derive(Debug, Default)]
pub struct OriginRateLimiter {
    next_allowed: HashMap<String, Instant>,
}

impl OriginRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next send slot for `origin` and return its deadline.
    ///
    /// Deadlines per origin are nondecreasing and successive reservations
    /// are spaced by at least `delay`. A zero delay is a no-op that leaves
    /// no state behind.
    pub fn compute_wait(&mut self, origin: &str, delay: Duration) -> Instant {
        self.compute_wait_at(origin, delay, Instant::now())
    }

    fn compute_wait_at(&mut self, origin: &str, delay: Duration, now: Instant) -> Instant {
        if delay.is_zero() {
            return now;
        }
        let wait = match self.next_allowed.get(origin) {
            Some(&next) => next.max(now),
            None => now,
        };
        self.next_allowed.insert(origin.to_string(), wait + delay);
        wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_origin_deadlines_are_spaced() {
        let mut limiter = OriginRateLimiter::new();
        let now = Instant::now();
        let delay = Duration::from_millis(500);

        let a = limiter.compute_wait_at("https://x.test", delay, now);
        let b = limiter.compute_wait_at("https://x.test", delay, now);
        let c = limiter.compute_wait_at("https://x.test", delay, now);

        assert_eq!(a, now);
        assert_eq!(b, now + delay);
        assert_eq!(c, now + delay * 2);
        assert!(a <= b && b <= c);
    }

    #[tokio::test]
    async fn test_origins_are_independent() {
        let mut limiter = OriginRateLimiter::new();
        let now = Instant::now();
        let delay = Duration::from_millis(500);

        let a = limiter.compute_wait_at("https://x.test", delay, now);
        let b = limiter.compute_wait_at("https://y.test", delay, now);
        assert_eq!(a, now);
        assert_eq!(b, now);
    }

    #[tokio::test]
    async fn test_zero_delay_is_noop() {
        let mut limiter = OriginRateLimiter::new();
        let now = Instant::now();

        let a = limiter.compute_wait_at("https://x.test", Duration::ZERO, now);
        assert_eq!(a, now);
        assert!(limiter.next_allowed.is_empty());
    }

    #[tokio::test]
    async fn test_idle_origin_restarts_from_now() {
        let mut limiter = OriginRateLimiter::new();
        let start = Instant::now();
        let delay = Duration::from_millis(100);

        limiter.compute_wait_at("https://x.test", delay, start);
        // Long after the window passed, the next reservation is immediate.
        let later = start + Duration::from_secs(10);
        let wait = limiter.compute_wait_at("https://x.test", delay, later);
        assert_eq!(wait, later);
    }
}
