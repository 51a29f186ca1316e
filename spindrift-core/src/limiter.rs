//! Dual-bucket rate limiting.
//!
//! A rate limiter pairs a sustained bucket with a peak bucket, each
//! defined by a limit over a window. A submission is allowed only when
//! both buckets can absorb it; otherwise the limiter reports the time
//! at which the caller should retry.

use std::time::{Duration, Instant};

/// Configuration of a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Units permitted per sustained window.
    pub sustained_rate_limit: u64,
    /// The sustained averaging window.
    pub sustained_rate_window: Duration,
    /// Units permitted per peak window.
    pub peak_rate_limit: u64,
    /// The peak averaging window.
    pub peak_rate_window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            sustained_rate_limit: u64::MAX,
            sustained_rate_window: Duration::from_secs(1),
            peak_rate_limit: u64::MAX,
            peak_rate_window: Duration::from_millis(10),
        }
    }
}

impl RateLimiterConfig {
    /// Create a configuration with no effective limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sustained limit and window.
    #[must_use]
    pub fn with_sustained(mut self, limit: u64, window: Duration) -> Self {
        self.sustained_rate_limit = limit;
        self.sustained_rate_window = window;
        self
    }

    /// Set the peak limit and window.
    #[must_use]
    pub fn with_peak(mut self, limit: u64, window: Duration) -> Self {
        self.peak_rate_limit = limit;
        self.peak_rate_window = window;
        self
    }
}

/// The outcome of submitting work to a rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiterDecision {
    /// The submission is within both limits.
    Allowed,
    /// The submission exceeds a limit; retry at the specified time.
    WaitUntil(Instant),
}

#[derive(Debug)]
struct TokenBucket {
    limit: u64,
    window: Duration,
    consumed: u64,
    window_start: Instant,
}

impl TokenBucket {
    fn new(limit: u64, window: Duration, now: Instant) -> Self {
        Self {
            limit,
            window,
            consumed: 0,
            window_start: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= self.window {
            self.consumed = 0;
            self.window_start = now;
        }
    }

    fn submit(&mut self, amount: u64, now: Instant) -> Option<Instant> {
        self.refill(now);
        if self.consumed.saturating_add(amount) <= self.limit {
            None
        } else {
            Some(self.window_start + self.window)
        }
    }

    fn commit(&mut self, amount: u64) {
        self.consumed = self.consumed.saturating_add(amount);
    }
}

/// A dual token bucket limiting sustained and peak rates.
#[derive(Debug)]
pub struct RateLimiter {
    sustained: TokenBucket,
    peak: TokenBucket,
}

impl RateLimiter {
    /// Create a rate limiter from the specified `config`, anchored at
    /// the specified current time `now`.
    #[must_use]
    pub fn new(config: &RateLimiterConfig, now: Instant) -> Self {
        Self {
            sustained: TokenBucket::new(
                config.sustained_rate_limit,
                config.sustained_rate_window,
                now,
            ),
            peak: TokenBucket::new(config.peak_rate_limit, config.peak_rate_window, now),
        }
    }

    /// Submit `amount` units at time `now`. When allowed, the units are
    /// consumed from both buckets; when denied, nothing is consumed and
    /// the decision names the earliest time a retry can succeed.
    pub fn submit(&mut self, amount: u64, now: Instant) -> RateLimiterDecision {
        let sustained_wait = self.sustained.submit(amount, now);
        let peak_wait = self.peak.submit(amount, now);
        match (sustained_wait, peak_wait) {
            (None, None) => {
                self.sustained.commit(amount);
                self.peak.commit(amount);
                RateLimiterDecision::Allowed
            }
            (a, b) => RateLimiterDecision::WaitUntil(a.into_iter().chain(b).max().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_by_default() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(&RateLimiterConfig::default(), now);
        for _ in 0..1000 {
            assert_eq!(limiter.submit(1 << 20, now), RateLimiterDecision::Allowed);
        }
    }

    #[test]
    fn sustained_limit_denies_and_names_retry_time() {
        let now = Instant::now();
        let config = RateLimiterConfig::new().with_sustained(10, Duration::from_secs(1));
        let mut limiter = RateLimiter::new(&config, now);

        assert_eq!(limiter.submit(10, now), RateLimiterDecision::Allowed);
        match limiter.submit(1, now) {
            RateLimiterDecision::WaitUntil(at) => {
                assert_eq!(at, now + Duration::from_secs(1));
            }
            RateLimiterDecision::Allowed => panic!("limit not applied"),
        }

        // After the window rolls over the budget is restored.
        let later = now + Duration::from_secs(1);
        assert_eq!(limiter.submit(1, later), RateLimiterDecision::Allowed);
    }

    #[test]
    fn peak_limit_is_independent() {
        let now = Instant::now();
        let config = RateLimiterConfig::new()
            .with_sustained(100, Duration::from_secs(1))
            .with_peak(10, Duration::from_millis(10));
        let mut limiter = RateLimiter::new(&config, now);

        assert_eq!(limiter.submit(10, now), RateLimiterDecision::Allowed);
        match limiter.submit(10, now) {
            RateLimiterDecision::WaitUntil(at) => {
                assert_eq!(at, now + Duration::from_millis(10));
            }
            RateLimiterDecision::Allowed => panic!("peak limit not applied"),
        }

        let later = now + Duration::from_millis(10);
        assert_eq!(limiter.submit(10, later), RateLimiterDecision::Allowed);
    }

    #[test]
    fn denied_submission_consumes_nothing() {
        let now = Instant::now();
        let config = RateLimiterConfig::new().with_sustained(10, Duration::from_secs(1));
        let mut limiter = RateLimiter::new(&config, now);

        assert_eq!(limiter.submit(8, now), RateLimiterDecision::Allowed);
        assert!(matches!(
            limiter.submit(5, now),
            RateLimiterDecision::WaitUntil(_)
        ));
        // The denied 5 units did not count against the budget.
        assert_eq!(limiter.submit(2, now), RateLimiterDecision::Allowed);
    }
}
