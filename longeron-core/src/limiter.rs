//! Rate limiting primitives: the leaky bucket and the dual-rate limiter.
//!
//! All drain arithmetic is performed in nanoseconds and saturates instead of
//! overflowing. The current time is always injected by the caller so the
//! engine's tests can drive virtual clocks.

use std::time::{Duration, Instant};

use crate::option::RateLimiterConfig;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// The longest representable wait before a submission becomes allowed.
pub const MAX_TIME_TO_SUBMIT: Duration = Duration::from_secs(u64::MAX);

/// Given `rate` units per second, the number of units a bucket must hold to
/// burst over `window`.
#[must_use]
pub fn calculate_capacity(rate: u64, window: Duration) -> u64 {
    let units = (u128::from(rate) * window.as_nanos()) / NANOS_PER_SEC;
    u64::try_from(units).unwrap_or(u64::MAX).max(1)
}

/// Given `rate` units per second, the window over which a bucket of
/// `capacity` units may burst. Inverse of [`calculate_capacity`] where
/// representable.
#[must_use]
pub fn calculate_time_window(rate: u64, capacity: u64) -> Duration {
    if rate == 0 {
        return MAX_TIME_TO_SUBMIT;
    }
    let nanos = (u128::from(capacity) * NANOS_PER_SEC) / u128::from(rate);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// A token bucket drained at a constant rate.
///
/// `current_usage` never exceeds `capacity` after an update and never goes
/// negative; the time to drain empty is `current_usage / drain_rate`.
#[derive(Debug)]
pub struct LeakyBucket {
    drain_rate: u64,
    capacity: u64,
    usage: u64,
    reserved: u64,
    last_update: Instant,
}

impl LeakyBucket {
    /// Create a bucket draining `drain_rate` units per second with room for
    /// `capacity` units, updated as of `now`.
    #[must_use]
    pub fn new(drain_rate: u64, capacity: u64, now: Instant) -> Self {
        Self {
            drain_rate: drain_rate.max(1),
            capacity: capacity.max(1),
            usage: 0,
            reserved: 0,
            last_update: now,
        }
    }

    /// The drain rate, in units per second.
    #[must_use]
    pub fn drain_rate(&self) -> u64 {
        self.drain_rate
    }

    /// The capacity, in units.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The usage after the most recent update, in units.
    #[must_use]
    pub fn current_usage(&self) -> u64 {
        self.usage
    }

    /// Drain the bucket for the time elapsed up to `now`.
    pub fn update_time(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update);
        self.last_update = now;

        let drained = (elapsed.as_nanos().saturating_mul(u128::from(self.drain_rate)))
            / NANOS_PER_SEC;
        let drained = u64::try_from(drained).unwrap_or(u64::MAX);
        self.usage = self.usage.saturating_sub(drained);
    }

    /// True if submitting `units` at `now` would exceed the capacity.
    pub fn would_overflow(&mut self, units: u64, now: Instant) -> bool {
        self.update_time(now);
        self.usage
            .saturating_add(self.reserved)
            .saturating_add(units)
            > self.capacity
    }

    /// Charge `units` to the bucket at `now`. The caller must have checked
    /// [`would_overflow`](Self::would_overflow) first.
    pub fn submit(&mut self, units: u64, now: Instant) {
        self.update_time(now);
        self.usage = self.usage.saturating_add(units);
        debug_assert!(self.usage <= self.capacity);
    }

    /// Record optimistic intent to submit `units` later. Reserved units
    /// count against overflow checks but not against usage.
    pub fn reserve(&mut self, units: u64) {
        self.reserved = self.reserved.saturating_add(units);
    }

    /// Convert `units` previously reserved into real usage at `now`.
    pub fn submit_reserved(&mut self, units: u64, now: Instant) {
        self.reserved = self.reserved.saturating_sub(units);
        self.submit(units, now);
    }

    /// Release `units` previously reserved without charging them.
    pub fn cancel_reserved(&mut self, units: u64) {
        self.reserved = self.reserved.saturating_sub(units);
    }

    /// The wait until one more unit becomes submittable at `now`; zero if
    /// one is submittable already.
    pub fn calculate_time_to_submit(&mut self, now: Instant) -> Duration {
        self.calculate_time_to_submit_amount(1, now)
    }

    /// The wait until `units` (clamped to the capacity) become submittable
    /// at once at `now`; zero if they fit already.
    pub fn calculate_time_to_submit_amount(&mut self, units: u64, now: Instant) -> Duration {
        self.update_time(now);
        let units = units.clamp(1, self.capacity);
        let pending = self.usage.saturating_add(self.reserved);
        let excess = pending.saturating_add(units).saturating_sub(self.capacity);
        if excess == 0 {
            return Duration::ZERO;
        }

        let nanos = (u128::from(excess) * NANOS_PER_SEC).div_ceil(u128::from(self.drain_rate));
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// A dual-rate limiter composed of a sustained bucket and a peak bucket.
///
/// A submission is allowed iff neither bucket would overflow.
#[derive(Debug)]
pub struct RateLimiter {
    sustained: LeakyBucket,
    peak: LeakyBucket,
}

impl RateLimiter {
    /// Create a limiter from its configuration, updated as of `now`.
    #[must_use]
    pub fn new(config: &RateLimiterConfig, now: Instant) -> Self {
        Self {
            sustained: LeakyBucket::new(
                config.sustained_rate_limit,
                calculate_capacity(config.sustained_rate_limit, config.sustained_rate_window),
                now,
            ),
            peak: LeakyBucket::new(
                config.peak_rate_limit,
                calculate_capacity(config.peak_rate_limit, config.peak_rate_window),
                now,
            ),
        }
    }

    /// True if the configuration round-trips through capacity and window
    /// calculations without loss.
    #[must_use]
    pub fn supports_rate_limits_exactly(config: &RateLimiterConfig) -> bool {
        let sustained_capacity =
            calculate_capacity(config.sustained_rate_limit, config.sustained_rate_window);
        let peak_capacity = calculate_capacity(config.peak_rate_limit, config.peak_rate_window);

        calculate_time_window(config.sustained_rate_limit, sustained_capacity)
            == config.sustained_rate_window
            && calculate_time_window(config.peak_rate_limit, peak_capacity)
                == config.peak_rate_window
    }

    /// The sustained bucket.
    #[must_use]
    pub fn sustained(&self) -> &LeakyBucket {
        &self.sustained
    }

    /// The peak bucket.
    #[must_use]
    pub fn peak(&self) -> &LeakyBucket {
        &self.peak
    }

    /// True if submitting `units` at `now` would overflow either bucket.
    pub fn would_overflow(&mut self, units: u64, now: Instant) -> bool {
        let sustained = self.sustained.would_overflow(units, now);
        let peak = self.peak.would_overflow(units, now);
        sustained || peak
    }

    /// Charge `units` to both buckets at `now`.
    pub fn submit(&mut self, units: u64, now: Instant) {
        self.sustained.submit(units, now);
        self.peak.submit(units, now);
    }

    /// The number of units submittable at `now` without overflowing either
    /// bucket.
    pub fn current_allowance(&mut self, now: Instant) -> u64 {
        self.sustained.update_time(now);
        self.peak.update_time(now);
        let sustained = self
            .sustained
            .capacity()
            .saturating_sub(self.sustained.current_usage());
        let peak = self.peak.capacity().saturating_sub(self.peak.current_usage());
        sustained.min(peak)
    }

    /// The wait until one more unit becomes submittable at `now`; zero if
    /// one is submittable already.
    pub fn calculate_time_to_submit(&mut self, now: Instant) -> Duration {
        let sustained = self.sustained.calculate_time_to_submit(now);
        let peak = self.peak.calculate_time_to_submit(now);
        sustained.max(peak)
    }

    /// The wait until `units` become submittable at once at `now`, clamped
    /// per bucket to that bucket's capacity.
    pub fn calculate_time_to_submit_amount(&mut self, units: u64, now: Instant) -> Duration {
        let sustained = self.sustained.calculate_time_to_submit_amount(units, now);
        let peak = self.peak.calculate_time_to_submit_amount(units, now);
        sustained.max(peak)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_usage_never_exceeds_capacity() {
        let start = Instant::now();
        let mut bucket = LeakyBucket::new(1000, 1000, start);

        for step in 0..10 {
            let now = start + Duration::from_millis(step * 10);
            if !bucket.would_overflow(100, now) {
                bucket.submit(100, now);
            }
            assert!(bucket.current_usage() <= bucket.capacity());
        }
    }

    #[test]
    fn bucket_drains_over_time() {
        let start = Instant::now();
        let mut bucket = LeakyBucket::new(1000, 1000, start);
        bucket.submit(1000, start);
        assert_eq!(bucket.current_usage(), 1000);

        bucket.update_time(start + Duration::from_millis(500));
        assert_eq!(bucket.current_usage(), 500);

        bucket.update_time(start + Duration::from_secs(10));
        assert_eq!(bucket.current_usage(), 0);
    }

    #[test]
    fn time_to_submit_zero_iff_submittable() {
        let start = Instant::now();
        let mut bucket = LeakyBucket::new(1000, 10, start);

        assert_eq!(bucket.calculate_time_to_submit(start), Duration::ZERO);
        bucket.submit(10, start);
        let wait = bucket.calculate_time_to_submit(start);
        assert!(wait > Duration::ZERO);
        assert_eq!(wait, Duration::from_millis(1));

        let later = start + wait;
        assert!(!bucket.would_overflow(1, later));
    }

    #[test]
    fn reserve_counts_against_overflow_only() {
        let start = Instant::now();
        let mut bucket = LeakyBucket::new(1000, 10, start);

        bucket.reserve(8);
        assert!(bucket.would_overflow(5, start));
        assert_eq!(bucket.current_usage(), 0);

        bucket.cancel_reserved(8);
        assert!(!bucket.would_overflow(5, start));

        bucket.reserve(4);
        bucket.submit_reserved(4, start);
        assert_eq!(bucket.current_usage(), 4);
    }

    #[test]
    fn capacity_window_inverses() {
        for rate in [1u64, 8, 1000, 1_000_000] {
            for capacity in [1u64, 10, 1000, 1 << 20] {
                let window = calculate_time_window(rate, capacity);
                let config = RateLimiterConfig {
                    sustained_rate_limit: rate,
                    sustained_rate_window: window,
                    peak_rate_limit: rate,
                    peak_rate_window: window,
                };
                if RateLimiter::supports_rate_limits_exactly(&config) {
                    assert_eq!(calculate_capacity(rate, window), capacity);
                }
            }
        }
    }

    #[test]
    fn limiter_allows_iff_both_allow() {
        let start = Instant::now();
        let config = RateLimiterConfig {
            sustained_rate_limit: 100,
            sustained_rate_window: Duration::from_secs(10),
            peak_rate_limit: 1000,
            peak_rate_window: Duration::from_millis(100),
        };
        let mut limiter = RateLimiter::new(&config, start);

        // Peak allows 100 units at once; sustained allows 1000.
        assert!(!limiter.would_overflow(100, start));
        assert!(limiter.would_overflow(101, start));

        limiter.submit(100, start);
        assert!(limiter.would_overflow(1, start));
        let wait = limiter.calculate_time_to_submit(start);
        assert!(wait > Duration::ZERO);
    }
}
