//! Retry backoff and circuit breaker used by the delivery client.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::ClientConfig;

/// Exponential backoff with bounded attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.retry_base_delay(),
            config.retry_max_delay(),
            config.retry_jitter(),
        )
    }

    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retrying after `failed_attempt` (1-based) failed.
    ///
    /// A server-supplied `retry_after` replaces the exponential step but is
    /// still capped at the maximum delay.
    pub fn delay_for(&self, failed_attempt: u32, retry_after: Option<Duration>) -> Duration {
        let step = match retry_after {
            Some(retry_after) => retry_after,
            None => {
                let exponent = failed_attempt.saturating_sub(1).min(20);
                self.base_delay.saturating_mul(1u32 << exponent)
            }
        };
        step.min(self.max_delay) + self.sample_jitter()
    }

    fn sample_jitter(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Whether a call may go to the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed
    Allowed,
    /// Cool-down elapsed; this caller carries the single probe request
    Probe,
    /// Circuit open; fail fast
    Rejected { retry_in: Duration },
}

#[derive(Debug)]
enum BreakerState {
    Closed { failures: u32 },
    Open { until: Instant },
    /// A probe is in flight. If it never reports back (cancelled), another
    /// probe is admitted once a further cool-down has passed.
    HalfOpen { since: Instant },
}

/// Consecutive-failure circuit breaker shared by all calls of one client.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_cooldown(),
        )
    }

    pub fn state(&self) -> CircuitState {
        match *self.lock() {
            BreakerState::Closed { .. } => CircuitState::Closed,
            BreakerState::Open { .. } => CircuitState::Open,
            BreakerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Consecutive transient failures counted while closed
    pub fn consecutive_failures(&self) -> u32 {
        match *self.lock() {
            BreakerState::Closed { failures } => failures,
            _ => self.threshold,
        }
    }

    pub fn try_acquire(&self) -> Admission {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, now: Instant) -> Admission {
        let mut state = self.lock();
        match *state {
            BreakerState::Closed { .. } => Admission::Allowed,
            BreakerState::Open { until } if now >= until => {
                *state = BreakerState::HalfOpen { since: now };
                Admission::Probe
            }
            BreakerState::Open { until } => Admission::Rejected {
                retry_in: until - now,
            },
            BreakerState::HalfOpen { since } if now >= since + self.cooldown => {
                *state = BreakerState::HalfOpen { since: now };
                Admission::Probe
            }
            BreakerState::HalfOpen { since } => Admission::Rejected {
                retry_in: (since + self.cooldown).saturating_duration_since(now),
            },
        }
    }

    /// The call succeeded; close the circuit.
    pub fn record_success(&self) {
        *self.lock() = BreakerState::Closed { failures: 0 };
    }

    /// The endpoint answered with a non-transient failure. It is reachable,
    /// so the consecutive transient count starts over.
    pub fn record_reachable(&self) {
        *self.lock() = BreakerState::Closed { failures: 0 };
    }

    /// A transient failure. Returns true if this failure opened the circuit.
    pub fn record_failure(&self) -> bool {
        self.record_failure_at(Instant::now())
    }

    pub(crate) fn record_failure_at(&self, now: Instant) -> bool {
        let mut state = self.lock();
        match *state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.threshold {
                    *state = BreakerState::Open {
                        until: now + self.cooldown,
                    };
                    true
                } else {
                    *state = BreakerState::Closed { failures };
                    false
                }
            }
            BreakerState::HalfOpen { .. } => {
                *state = BreakerState::Open {
                    until: now + self.cooldown,
                };
                true
            }
            BreakerState::Open { .. } => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_millis(100),
            Duration::from_millis(350),
            Duration::ZERO,
        );
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(350));
        assert_eq!(policy.delay_for(30, None), Duration::from_millis(350));
    }

    #[test]
    fn test_retry_after_is_capped() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(100),
            Duration::from_secs(2),
            Duration::ZERO,
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(1))),
            Duration::from_secs(1)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(60))),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(100),
            Duration::from_secs(1),
            Duration::from_millis(50),
        );
        for _ in 0..100 {
            let delay = policy.delay_for(1, None);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_max_attempts_at_least_one() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_breaker_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));
        let now = Instant::now();

        assert!(!breaker.record_failure_at(now));
        assert!(!breaker.record_failure_at(now));
        assert_eq!(breaker.try_acquire_at(now), Admission::Allowed);
        assert!(breaker.record_failure_at(now));

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            breaker.try_acquire_at(now + Duration::from_secs(1)),
            Admission::Rejected { .. }
        ));
    }

    #[test]
    fn test_breaker_admits_single_probe_after_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        let now = Instant::now();
        breaker.record_failure_at(now);

        let later = now + Duration::from_secs(10);
        assert_eq!(breaker.try_acquire_at(later), Admission::Probe);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(matches!(
            breaker.try_acquire_at(later),
            Admission::Rejected { .. }
        ));

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.try_acquire_at(later), Admission::Allowed);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(5));
        let now = Instant::now();
        breaker.record_failure_at(now);
        breaker.record_failure_at(now);

        let probe_time = now + Duration::from_secs(5);
        assert_eq!(breaker.try_acquire_at(probe_time), Admission::Probe);
        assert!(breaker.record_failure_at(probe_time));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(
            breaker.try_acquire_at(probe_time + Duration::from_secs(1)),
            Admission::Rejected {
                retry_in: Duration::from_secs(4)
            }
        );
    }

    #[test]
    fn test_abandoned_probe_is_replaced() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(5));
        let now = Instant::now();
        breaker.record_failure_at(now);

        let probe_time = now + Duration::from_secs(5);
        assert_eq!(breaker.try_acquire_at(probe_time), Admission::Probe);
        // probe never reports back
        assert_eq!(
            breaker.try_acquire_at(probe_time + Duration::from_secs(5)),
            Admission::Probe
        );
    }

    #[test]
    fn test_reachable_resets_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(5));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.consecutive_failures(), 2);
        breaker.record_reachable();
        assert_eq!(breaker.consecutive_failures(), 0);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
