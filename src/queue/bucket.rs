//! Global token bucket for coordinated send throttling.
//!
//! Every worker, in every process, withdraws one token before each send. The
//! bucket refills lazily from elapsed time on each withdrawal attempt; there
//! is no background timer. The Redis store runs the same arithmetic inside a
//! Lua script against the server clock, and `MemoryStore` runs it here.

use std::time::Duration;

use tokio::time::Instant;

/// Shape of the global bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    /// Maximum tokens held (burst size).
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl Default for BucketSpec {
    fn default() -> Self {
        Self {
            capacity: 30,
            refill_per_sec: 30.0,
        }
    }
}

impl BucketSpec {
    /// Create a bucket with custom capacity and refill rate.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    /// Time for an empty bucket to become full again.
    pub fn full_refill_time(&self) -> Duration {
        if self.refill_per_sec <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64(self.capacity as f64 / self.refill_per_sec).unwrap_or(Duration::MAX)
    }
}

/// Token bucket state.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A bucket starts full.
    pub fn full(spec: &BucketSpec, now: Instant) -> Self {
        Self {
            tokens: spec.capacity as f64,
            last_refill: now,
        }
    }

    /// Tokens currently available, without refilling.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Add tokens for the time elapsed since the last refill, capped at capacity.
    pub fn refill(&mut self, spec: &BucketSpec, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * spec.refill_per_sec).min(spec.capacity as f64);
        self.last_refill = now;
    }

    /// Refill, then withdraw one token if available.
    pub fn try_take(&mut self, spec: &BucketSpec, now: Instant) -> bool {
        self.refill(spec, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_spec_default() {
        let spec = BucketSpec::default();
        assert_eq!(spec.capacity, 30);
        assert_eq!(spec.refill_per_sec, 30.0);
        assert_eq!(spec.full_refill_time(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_refill_never_fills() {
        assert_eq!(BucketSpec::new(5, 0.0).full_refill_time(), Duration::MAX);
    }

    #[test]
    fn test_new_bucket_allows_burst_up_to_capacity() {
        let spec = BucketSpec::new(5, 1.0);
        let now = Instant::now();
        let mut bucket = TokenBucket::full(&spec, now);

        for _ in 0..5 {
            assert!(bucket.try_take(&spec, now));
        }
        assert!(!bucket.try_take(&spec, now));
    }

    #[test]
    fn test_refill_is_proportional_to_elapsed_time() {
        let spec = BucketSpec::new(10, 4.0);
        let start = Instant::now();
        let mut bucket = TokenBucket::full(&spec, start);
        for _ in 0..10 {
            bucket.try_take(&spec, start);
        }

        bucket.refill(&spec, start + Duration::from_millis(500));
        assert!((bucket.tokens() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let spec = BucketSpec::new(3, 100.0);
        let start = Instant::now();
        let mut bucket = TokenBucket::full(&spec, start);
        bucket.try_take(&spec, start);

        bucket.refill(&spec, start + Duration::from_secs(60));
        assert_eq!(bucket.tokens(), 3.0);
    }

    #[test]
    fn test_clock_going_backwards_adds_nothing() {
        let spec = BucketSpec::new(2, 10.0);
        let start = Instant::now() + Duration::from_secs(1);
        let mut bucket = TokenBucket::full(&spec, start);
        bucket.try_take(&spec, start);
        bucket.try_take(&spec, start);

        assert!(!bucket.try_take(&spec, start - Duration::from_millis(500)));
    }

    #[test]
    fn test_sustained_rate_matches_refill() {
        let spec = BucketSpec::new(30, 30.0);
        let start = Instant::now();
        let mut bucket = TokenBucket::full(&spec, start);

        // Try every millisecond for 10 seconds.
        let granted = (0..10_000)
            .filter(|ms| bucket.try_take(&spec, start + Duration::from_millis(*ms)))
            .count();

        // Initial burst plus refill over ten seconds.
        assert!(granted <= 30 + 300, "granted {}", granted);
        assert!(granted >= 300, "granted {}", granted);
    }
}
