//! Per-upstream circuit breaker.
//!
//! Ported from the upstream SDK's transport resilience layer
//! (`turbomcp-transport::resilience::circuit_breaker`), with defaults tuned
//! to the gateway's own spec rather than the SDK's generic ones: 5 failures
//! trip the breaker, the cool-down is 30s, and a single half-open probe is
//! let through before deciding to close or reopen.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
    pub rolling_window_size: usize,
    pub minimum_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            open_timeout: Duration::from_secs(30),
            rolling_window_size: 20,
            minimum_requests: 5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    at: Instant,
    success: bool,
}

/// Fails fast during a degraded period, then lets exactly one probe call
/// through to decide whether the upstream has recovered.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_transition: Instant,
    window: VecDeque<Outcome>,
    last_error: Option<String>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            last_transition: Instant::now(),
            window: VecDeque::new(),
            last_error: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Whether a caller should be allowed through right now. Advances the
    /// `Open -> HalfOpen` transition as a side effect once the cool-down has
    /// elapsed, so this must be called before every attempt.
    pub fn should_allow(&mut self) -> bool {
        if self.state == CircuitState::Open && self.last_transition.elapsed() >= self.config.open_timeout {
            self.state = CircuitState::HalfOpen;
            self.last_transition = Instant::now();
            self.half_open_successes = 0;
        }
        !matches!(self.state, CircuitState::Open)
    }

    pub fn record_success(&mut self, duration: Duration) {
        self.push_outcome(true, duration);
        match self.state {
            CircuitState::Closed => self.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.success_threshold {
                    self.close();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self, duration: Duration, error: impl Into<String>) {
        self.push_outcome(false, duration);
        self.last_error = Some(error.into());
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.window.len() as u32 >= self.config.minimum_requests
                    && self.consecutive_failures >= self.config.failure_threshold
                {
                    self.open();
                }
            }
            CircuitState::HalfOpen => self.open(),
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.clone()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn push_outcome(&mut self, success: bool, duration: Duration) {
        let _ = duration;
        self.window.push_back(Outcome {
            at: Instant::now(),
            success,
        });
        while self.window.len() > self.config.rolling_window_size {
            self.window.pop_front();
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.last_transition = Instant::now();
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.last_transition = Instant::now();
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
        self.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tripped(failures: u32) -> CircuitBreaker {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: failures,
            minimum_requests: failures,
            ..CircuitBreakerConfig::default()
        });
        for _ in 0..failures {
            cb.record_failure(Duration::from_millis(10), "boom");
        }
        cb
    }

    #[test]
    fn starts_closed_and_allows_calls() {
        let mut cb = CircuitBreaker::with_defaults();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.should_allow());
    }

    #[test]
    fn opens_after_five_consecutive_failures() {
        let mut cb = tripped(5);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.should_allow());
    }

    #[test]
    fn success_resets_consecutive_failure_count() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            minimum_requests: 3,
            ..CircuitBreakerConfig::default()
        });
        cb.record_failure(Duration::from_millis(1), "a");
        cb.record_failure(Duration::from_millis(1), "b");
        cb.record_success(Duration::from_millis(1));
        cb.record_failure(Duration::from_millis(1), "c");
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            minimum_requests: 1,
            success_threshold: 1,
            open_timeout: Duration::from_millis(20),
            ..CircuitBreakerConfig::default()
        });
        cb.record_failure(Duration::from_millis(1), "boom");
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.should_allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success(Duration::from_millis(1));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_reopens_on_failure() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            minimum_requests: 1,
            open_timeout: Duration::from_millis(20),
            ..CircuitBreakerConfig::default()
        });
        cb.record_failure(Duration::from_millis(1), "boom");
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.should_allow());
        cb.record_failure(Duration::from_millis(1), "still down");
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
