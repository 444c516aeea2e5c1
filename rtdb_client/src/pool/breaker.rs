//! Per-connection [`CircuitBreaker`], spec §3/§4.10, grounded on
//! `CircuitBreaker` in
//! `examples/original_source/src/spacetimedb_sdk/connection_pool.py`.

use crate::time::{Duration, Timestamp};

/// Failure-isolation state of one pooled connection, spec §4.10's
/// transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Tracks consecutive failures and trips/recovers per the transition table
/// in spec §4.10. Not thread-safe on its own; the pool guards it behind a
/// per-connection mutex (spec §5's locking discipline).
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_requests: u32,
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Timestamp>,
    half_open_successes: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, half_open_requests: u32) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            half_open_requests,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            half_open_successes: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Records a successful operation. In `HalfOpen`, closes the breaker
    /// once `half_open_requests` successes have accumulated; in `Closed`,
    /// resets the failure counter.
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.half_open_requests {
                    self.close();
                }
            }
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed operation at `now`. Any failure while `HalfOpen`
    /// reopens the breaker immediately (spec §4.10: "on any failure").
    pub fn record_failure(&mut self, now: Timestamp) {
        self.failure_count += 1;
        self.last_failure_time = Some(now);
        match self.state {
            CircuitState::HalfOpen => self.open(),
            CircuitState::Closed if self.failure_count >= self.failure_threshold => self.open(),
            _ => {}
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.half_open_successes = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.half_open_successes = 0;
    }

    /// Evaluates whether the breaker should transition `Open -> HalfOpen`
    /// as of `now`, and returns whether the breaker currently admits a
    /// request (spec §8 property 4/5).
    pub fn is_available(&mut self, now: Timestamp) -> bool {
        if self.state == CircuitState::Open {
            let elapsed = self
                .last_failure_time
                .map(|t| now.checked_sub_timestamp(t))
                .unwrap_or(Duration::zero());
            if elapsed >= self.recovery_timeout {
                self.state = CircuitState::HalfOpen;
                self.half_open_successes = 0;
                return true;
            }
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(60), 2)
    }

    #[test]
    fn trips_open_after_threshold_consecutive_failures() {
        let mut b = breaker();
        let t = Timestamp::from_micros(0);
        b.record_failure(t);
        b.record_failure(t);
        assert_eq!(b.state(), CircuitState::Closed);
        b.record_failure(t);
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn open_breaker_blocks_until_recovery_elapses() {
        let mut b = breaker();
        let t0 = Timestamp::from_micros(0);
        for _ in 0..3 {
            b.record_failure(t0);
        }
        assert!(!b.is_available(t0 + Duration::from_secs(10)));
        assert!(b.is_available(t0 + Duration::from_secs(60)));
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_required_successes() {
        let mut b = breaker();
        let t0 = Timestamp::from_micros(0);
        for _ in 0..3 {
            b.record_failure(t0);
        }
        b.is_available(t0 + Duration::from_secs(60));
        b.record_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let mut b = breaker();
        let t0 = Timestamp::from_micros(0);
        for _ in 0..3 {
            b.record_failure(t0);
        }
        b.is_available(t0 + Duration::from_secs(60));
        b.record_failure(t0 + Duration::from_secs(61));
        assert_eq!(b.state(), CircuitState::Open);
    }
}
