//! Circuit Breaker
//!
//! Three-state failure isolation (Closed / Open / HalfOpen) for feed session
//! operations. Time comes from an injected [`Clock`] so transitions can be
//! tested without real delays.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::clock::SharedClock;
use crate::error::{RelayError, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls go through
    Closed,
    /// Failure threshold exceeded - calls fail fast
    Open,
    /// Cooldown elapsed - exactly one trial call allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Failures only count as consecutive inside this window
    pub failure_window: Duration,
    /// How long the circuit stays open before allowing a trial
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(30),
            open_duration: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    streak_started_at: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    total_trips: u64,
    last_error: Option<String>,
}

/// Statistics for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_trips: u64,
    pub last_error: Option<String>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerState>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Admission ticket for one call. Dropping it unresolved frees a half-open
/// trial slot without counting as success or failure.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl Permit<'_> {
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self, reason: &str) {
        self.resolved = true;
        self.breaker.record_failure(reason);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                streak_started_at: None,
                opened_at: None,
                trial_in_flight: false,
                total_trips: 0,
                last_error: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cooldown_elapsed(&self, inner: &BreakerState) -> bool {
        inner
            .opened_at
            .map(|at| self.clock.now().saturating_duration_since(at) >= self.config.open_duration)
            .unwrap_or(true)
    }

    /// Current state. An open circuit whose cooldown has elapsed reports
    /// `HalfOpen` without consuming the trial.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open if self.cooldown_elapsed(&inner) => CircuitState::HalfOpen,
            state => state,
        }
    }

    /// Healthy unless the circuit is (still) open
    pub fn is_healthy(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Seconds until an open circuit admits a trial
    pub fn retry_in_secs(&self) -> u64 {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => {
                let elapsed = self.clock.now().saturating_duration_since(at);
                self.config.open_duration.saturating_sub(elapsed).as_secs()
            }
            _ => 0,
        }
    }

    /// Ask to run one operation. Fails fast while open, or while the single
    /// half-open trial is already in flight.
    pub fn try_acquire(&self) -> Result<Permit<'_>> {
        let mut inner = self.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if !self.cooldown_elapsed(&inner) {
                    drop(inner);
                    return Err(self.open_error());
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                info!(breaker = %self.name, "circuit breaker half-open, allowing trial call");
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    drop(inner);
                    return Err(self.open_error());
                }
                inner.trial_in_flight = true;
                true
            }
        };

        Ok(Permit {
            breaker: self,
            trial,
            resolved: false,
        })
    }

    fn open_error(&self) -> RelayError {
        RelayError::CircuitOpen {
            name: self.name.clone(),
            retry_in_secs: self.retry_in_secs(),
        }
    }

    /// Run `op` through the breaker, recording its outcome.
    pub async fn call<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure(&format!("{}: {}", op_name, e));
                Err(e)
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.streak_started_at = None;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.trial_in_flight = false;
            info!(breaker = %self.name, "circuit breaker closed after successful trial");
        }
    }

    pub fn record_failure(&self, reason: &str) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.last_error = Some(reason.to_string());

        match inner.state {
            CircuitState::HalfOpen => {
                self.trip(&mut inner, now);
                warn!(breaker = %self.name, reason, "trial call failed, circuit re-opened");
            }
            CircuitState::Open => {}
            CircuitState::Closed => {
                let in_window = inner
                    .streak_started_at
                    .map(|start| now.saturating_duration_since(start) <= self.config.failure_window)
                    .unwrap_or(false);
                if in_window {
                    inner.consecutive_failures += 1;
                } else {
                    inner.consecutive_failures = 1;
                    inner.streak_started_at = Some(now);
                }

                debug!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    reason,
                    "circuit breaker recorded failure"
                );

                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner, now);
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        open_secs = self.config.open_duration.as_secs(),
                        "circuit breaker TRIPPED"
                    );
                }
            }
        }
    }

    fn trip(&self, inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.trial_in_flight = false;
        inner.total_trips += 1;
    }

    /// Force close the circuit (manual reset)
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.streak_started_at = None;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        info!(breaker = %self.name, "circuit breaker manually reset");
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state();
        let inner = self.lock();
        CircuitBreakerStats {
            state,
            consecutive_failures: inner.consecutive_failures,
            total_trips: inner.total_trips,
            last_error: inner.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::clock::ManualClock;
    use std::sync::Arc;

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default(), clock.clone());
        (cb, clock)
    }

    #[test]
    fn test_initial_state_closed() {
        let (cb, _) = breaker();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_opens_after_five_failures_in_window() {
        let (cb, clock) = breaker();
        for _ in 0..4 {
            cb.record_failure("boom");
            clock.advance(Duration::from_secs(5));
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure("boom");
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(
            cb.try_acquire(),
            Err(RelayError::CircuitOpen { .. })
        ));
        assert_eq!(cb.stats().total_trips, 1);
    }

    #[test]
    fn test_failures_outside_window_restart_streak() {
        let (cb, clock) = breaker();
        for _ in 0..4 {
            cb.record_failure("boom");
        }
        clock.advance(Duration::from_secs(31));
        cb.record_failure("boom");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 1);
    }

    #[test]
    fn test_success_resets_failures() {
        let (cb, _) = breaker();
        for _ in 0..4 {
            cb.record_failure("boom");
        }
        cb.record_success();
        cb.record_failure("boom");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 1);
    }

    #[test]
    fn test_half_open_allows_exactly_one_trial() {
        let (cb, clock) = breaker();
        for _ in 0..5 {
            cb.record_failure("boom");
        }
        clock.advance(Duration::from_secs(59));
        assert!(cb.try_acquire().is_err());

        clock.advance(Duration::from_secs(1));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let trial = cb.try_acquire().expect("trial should be admitted");
        assert!(cb.try_acquire().is_err());

        trial.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_failed_trial_reopens() {
        let (cb, clock) = breaker();
        for _ in 0..5 {
            cb.record_failure("boom");
        }
        clock.advance(Duration::from_secs(60));
        cb.try_acquire().unwrap().failure("still down");
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().total_trips, 2);
        assert_eq!(cb.retry_in_secs(), 60);
    }

    #[test]
    fn test_dropped_trial_frees_slot() {
        let (cb, clock) = breaker();
        for _ in 0..5 {
            cb.record_failure("boom");
        }
        clock.advance(Duration::from_secs(60));
        drop(cb.try_acquire().unwrap());
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_call_records_outcomes() {
        let (cb, _) = breaker();
        for _ in 0..5 {
            let res: Result<()> = cb
                .call("join", || async { Err(RelayError::Feed("down".into())) })
                .await;
            assert!(res.is_err());
        }
        let attempted = std::sync::atomic::AtomicBool::new(false);
        let res: Result<()> = cb
            .call("join", || async {
                attempted.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(RelayError::CircuitOpen { .. })));
        assert!(!attempted.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_manual_reset() {
        let (cb, _) = breaker();
        for _ in 0..5 {
            cb.record_failure("boom");
        }
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
