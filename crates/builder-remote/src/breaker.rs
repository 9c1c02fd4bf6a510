// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-endpoint circuit breaker.
//!
//! Classic three-state machine over a rolling outcome window:
//!
//! ```text
//! CLOSED ──(failure rate ≥ threshold over window)──► OPEN
//! OPEN   ──(cooldown elapsed)──────────────────────► HALF_OPEN
//! HALF_OPEN ──(probe success)──► CLOSED
//! HALF_OPEN ──(probe failure)──► OPEN (cooldown restarts)
//! ```
//!
//! One breaker per destination endpoint; outcomes older than the window are
//! dropped before the rate is evaluated, so a burst of ancient failures
//! cannot keep an endpoint condemned.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Breaker state, exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Traffic flows; outcomes are being recorded.
    Closed,
    /// Traffic is refused until the cooldown elapses.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Rolling window over which the failure rate is computed.
    pub window: Duration,
    /// Minimum outcomes in the window before the breaker may trip.
    pub min_samples: usize,
    /// Failure rate in `[0, 1]` that trips the breaker.
    pub failure_threshold: f64,
    /// How long an open breaker refuses traffic before probing.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            min_samples: 5,
            failure_threshold: 0.5,
            cooldown: Duration::from_secs(10),
        }
    }
}

/// Rolling-window circuit breaker for one endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    half_open_probe_inflight: bool,
}

impl CircuitBreaker {
    /// Breaker with the given tuning, starting closed.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            outcomes: VecDeque::new(),
            opened_at: None,
            half_open_probe_inflight: false,
        }
    }

    /// Current state (after cooldown promotion, if due).
    pub fn state(&mut self) -> BreakerState {
        self.promote_if_cooled();
        self.state
    }

    /// May a call proceed right now?
    ///
    /// In half-open, exactly one probe is admitted; further calls are
    /// refused until the probe reports.
    pub fn allow(&mut self) -> bool {
        self.promote_if_cooled();
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if self.half_open_probe_inflight {
                    false
                } else {
                    self.half_open_probe_inflight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Closed;
                self.outcomes.clear();
                self.opened_at = None;
                self.half_open_probe_inflight = false;
            }
            _ => self.push_outcome(true),
        }
    }

    /// Record a failed call.
    pub fn record_failure(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                // Failed probe: back to open, cooldown restarts.
                self.trip();
            }
            _ => {
                self.push_outcome(false);
                if self.should_trip() {
                    self.trip();
                }
            }
        }
    }

    fn push_outcome(&mut self, success: bool) {
        self.outcomes.push_back((Instant::now(), success));
        self.evict_stale();
    }

    fn evict_stale(&mut self) {
        let horizon = Instant::now() - self.config.window;
        while matches!(self.outcomes.front(), Some(&(at, _)) if at < horizon) {
            self.outcomes.pop_front();
        }
    }

    fn should_trip(&mut self) -> bool {
        self.evict_stale();
        let total = self.outcomes.len();
        if total < self.config.min_samples {
            return false;
        }
        let failures = self.outcomes.iter().filter(|(_, ok)| !ok).count();
        #[allow(clippy::cast_precision_loss)]
        let rate = failures as f64 / total as f64;
        rate >= self.config.failure_threshold
    }

    fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_probe_inflight = false;
    }

    fn promote_if_cooled(&mut self) {
        if self.state == BreakerState::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= self.config.cooldown {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_probe_inflight = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            window: Duration::from_secs(60),
            min_samples: 4,
            failure_threshold: 0.5,
            cooldown: Duration::from_millis(30),
        }
    }

    #[test]
    fn stays_closed_below_threshold() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..10 {
            breaker.record_success();
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn trips_at_failure_rate() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn needs_min_samples_to_trip() {
        let mut breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed, "2 < min_samples");
    }

    #[test]
    fn half_open_admits_one_probe_then_closes_on_success() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.allow(), "first probe admitted");
        assert!(!breaker.allow(), "second call refused while probe in flight");

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.allow());
    }

    #[test]
    fn failed_probe_reopens() {
        let mut breaker = CircuitBreaker::new(fast_config());
        for _ in 0..4 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }
}
