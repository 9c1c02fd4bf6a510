// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Token-bucket rate limiting with adaptive shrinkage.
//!
//! One bucket per destination endpoint, refilled continuously at `rate`
//! tokens per second up to `capacity`. When the endpoint's circuit breaker
//! trips, callers [`shrink`](TokenBucket::shrink) the bucket — the refill
//! rate halves down to a floor — and each successful call afterwards
//! [`recover`](TokenBucket::recover)s it multiplicatively back toward the
//! configured rate. Pressure backs off quickly and returns gradually.

use std::time::Instant;

/// Continuous-refill token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    /// Configured steady-state refill rate (tokens/second).
    base_rate: f64,
    /// Current (possibly shrunk) refill rate.
    rate: f64,
    /// Floor the rate cannot shrink below.
    min_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket with `capacity` burst tokens refilled at `rate` per second.
    pub fn new(capacity: f64, rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            base_rate: rate,
            rate,
            min_rate: (rate / 16.0).max(0.1),
            last_refill: Instant::now(),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Current refill rate (tokens/second).
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Halve the refill rate (bounded by the floor). Called when the
    /// endpoint's breaker trips.
    pub fn shrink(&mut self) {
        self.refill();
        self.rate = (self.rate / 2.0).max(self.min_rate);
        // Drop accumulated burst too; a tripped endpoint gets no grace.
        self.tokens = self.tokens.min(1.0);
    }

    /// Recover 10% of the distance back to the configured rate. Called on
    /// successful calls after a shrink.
    pub fn recover(&mut self) {
        self.refill();
        self.rate = self
            .base_rate
            .min(self.rate + (self.base_rate - self.rate) * 0.1);
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_up_to_capacity_then_refused() {
        let mut bucket = TokenBucket::new(3.0, 1.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire(), "burst capacity spent");
    }

    #[test]
    fn refills_over_time() {
        let mut bucket = TokenBucket::new(1.0, 50.0);
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
        std::thread::sleep(Duration::from_millis(40));
        assert!(bucket.try_acquire(), "50/s refills one token in 40ms");
    }

    #[test]
    fn shrink_halves_and_floors() {
        let mut bucket = TokenBucket::new(10.0, 8.0);
        bucket.shrink();
        assert!((bucket.rate() - 4.0).abs() < f64::EPSILON);
        for _ in 0..20 {
            bucket.shrink();
        }
        assert!(bucket.rate() >= 0.1, "rate never shrinks to zero");
    }

    #[test]
    fn recover_approaches_base_rate() {
        let mut bucket = TokenBucket::new(10.0, 8.0);
        bucket.shrink();
        bucket.shrink();
        let shrunk = bucket.rate();
        for _ in 0..100 {
            bucket.recover();
        }
        assert!(bucket.rate() > shrunk);
        assert!(bucket.rate() <= 8.0 + f64::EPSILON, "never overshoots");
    }
}
